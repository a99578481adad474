//! Weather lookups from a static fixture table.

use std::fmt::Write as _;

use agent_core::{ParameterSchema, ToolSchema};
use agent_remote::ServerTool;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub struct WeatherTool;

struct Conditions {
    city: &'static str,
    temp_c: f32,
    feels_like_c: f32,
    humidity: u8,
    wind_ms: f32,
    description: &'static str,
    /// Five daily (high, description) pairs
    outlook: [(f32, &'static str); 5],
}

const DAYS: [&str; 5] = ["Day 1", "Day 2", "Day 3", "Day 4", "Day 5"];

fn lookup(location: &str) -> Option<Conditions> {
    // "Paris, FR" and "paris" both match
    let city = location.split(',').next().unwrap_or(location).trim().to_lowercase();
    let conditions = match city.as_str() {
        "paris" => Conditions {
            city: "Paris",
            temp_c: 14.2,
            feels_like_c: 13.1,
            humidity: 72,
            wind_ms: 3.6,
            description: "Light Rain",
            outlook: [(15.0, "Light Rain"), (17.5, "Scattered Clouds"), (19.0, "Clear Sky"), (18.2, "Broken Clouds"), (16.4, "Light Rain")],
        },
        "tokyo" => Conditions {
            city: "Tokyo",
            temp_c: 21.8,
            feels_like_c: 22.0,
            humidity: 64,
            wind_ms: 2.1,
            description: "Clear Sky",
            outlook: [(23.1, "Clear Sky"), (24.0, "Few Clouds"), (22.6, "Overcast Clouds"), (20.9, "Moderate Rain"), (21.7, "Few Clouds")],
        },
        "new york" => Conditions {
            city: "New York",
            temp_c: 9.5,
            feels_like_c: 6.8,
            humidity: 55,
            wind_ms: 6.2,
            description: "Overcast Clouds",
            outlook: [(11.0, "Overcast Clouds"), (13.4, "Clear Sky"), (12.2, "Clear Sky"), (8.7, "Light Rain"), (10.1, "Scattered Clouds")],
        },
        "london" => Conditions {
            city: "London",
            temp_c: 11.3,
            feels_like_c: 10.2,
            humidity: 81,
            wind_ms: 4.9,
            description: "Drizzle",
            outlook: [(12.0, "Drizzle"), (12.8, "Broken Clouds"), (13.5, "Light Rain"), (14.1, "Scattered Clouds"), (12.9, "Overcast Clouds")],
        },
        "sydney" => Conditions {
            city: "Sydney",
            temp_c: 24.6,
            feels_like_c: 25.0,
            humidity: 58,
            wind_ms: 5.4,
            description: "Few Clouds",
            outlook: [(26.2, "Few Clouds"), (27.0, "Clear Sky"), (25.1, "Thunderstorm"), (23.8, "Moderate Rain"), (24.9, "Clear Sky")],
        },
        "berlin" => Conditions {
            city: "Berlin",
            temp_c: 8.1,
            feels_like_c: 5.9,
            humidity: 77,
            wind_ms: 5.0,
            description: "Mist",
            outlook: [(9.4, "Mist"), (10.6, "Overcast Clouds"), (11.2, "Light Rain"), (9.9, "Light Rain"), (10.3, "Broken Clouds")],
        },
        _ => return None,
    };
    Some(conditions)
}

fn render(c: &Conditions) -> String {
    let mut out = format!("Weather Forecast for {}\n\n", c.city);
    out.push_str("Current Conditions:\n");
    let _ = writeln!(out, "   Temperature: {}°C (feels like {}°C)", c.temp_c, c.feels_like_c);
    let _ = writeln!(out, "   Conditions: {}", c.description);
    let _ = writeln!(out, "   Humidity: {}%", c.humidity);
    let _ = writeln!(out, "   Wind Speed: {} m/s", c.wind_ms);
    out.push_str("\n5-Day Forecast:\n");
    for (day, (temp, desc)) in DAYS.iter().zip(c.outlook) {
        let _ = writeln!(out, "   {day}: {temp}°C - {desc}");
    }
    out
}

#[async_trait]
impl ServerTool for WeatherTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "get_weather",
            "Get current weather and 5-day forecast for a location. Includes temperature, conditions, humidity, and wind speed.",
        )
        .with_parameters(&[ParameterSchema::required(
            "location",
            "string",
            "City name or 'City, Country Code' (e.g., 'Paris', 'Tokyo, JP', 'New York, US')",
        )])
    }

    async fn call(&self, arguments: Map<String, Value>) -> anyhow::Result<String> {
        let location = arguments
            .get("location")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("'location' must be a non-empty string"))?;

        lookup(location).map(|c| render(&c)).ok_or_else(|| {
            anyhow::anyhow!(
                "Could not find location: {location}. Please check the spelling or try a different format (e.g., 'Paris, FR')."
            )
        })
    }
}

use std::collections::HashMap;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::command::{CommandTag, RecoveredCommand, Recovery};

const TEXT_FIELDS: &[&str] = &[
    "meal_type",
    "time_of_day",
    "preference",
    "status",
    "goal_id",
    "name",
    "unit",
    "serving_unit",
];

const NUMBER_FIELDS: &[&str] = &[
    "calories",
    "protein",
    "carbs",
    "fat",
    "days",
    "daily_calories",
    "amount",
    "serving_size",
];

const MACRO_FIELDS: &[&str] = &["calories", "protein", "carbs", "fat"];

static TEXT_PATTERNS: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    TEXT_FIELDS
        .iter()
        .map(|field| {
            // a single-quoted value ends at the quote that precedes `,` `}` `]` or the end
            let pattern = format!(r#"["']{}["']\s*:\s*(?:"([^"]+)"|'(.+?)'\s*(?:[,}}\]]|$))"#, field);
            (*field, Regex::new(&pattern).expect("valid regex"))
        })
        .collect()
});

static NUMBER_PATTERNS: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    NUMBER_FIELDS
        .iter()
        .map(|field| {
            let pattern = format!(r#"["']{}["']\s*:\s*["']?(\d+(?:\.\d+)?)"#, field);
            (*field, Regex::new(&pattern).expect("valid regex"))
        })
        .collect()
});

/// Field-by-field recovery for payloads the repair engine gave up on.
///
/// Works on the raw candidate text, so it does not care whether the JSON
/// around a field is valid. Always returns a complete command.
pub struct FallbackExtractor;

impl FallbackExtractor {
    pub fn extract(tag: CommandTag, candidate: &str) -> Recovery {
        warn!("Falling back to field extraction for {} payload", tag);
        let object = Self::scrape(tag, candidate);
        RecoveredCommand::from_object(tag, &object)
    }

    /// Collect whatever fields of `tag` can be found in `text`.
    pub fn scrape(tag: CommandTag, text: &str) -> Map<String, Value> {
        let mut object = Map::new();

        match tag {
            CommandTag::MealSuggestion => {
                copy_text(text, &["meal_type", "time_of_day", "preference"], &mut object);
                let mut macros = Map::new();
                copy_numbers(text, MACRO_FIELDS, &mut macros);
                object.insert("remaining_macros".to_string(), Value::Object(macros));
            }
            CommandTag::MealPlanGenerate => {
                copy_text(text, &["status", "preference"], &mut object);
                copy_numbers(text, &["days"], &mut object);
            }
            CommandTag::GoalModify => {
                copy_text(text, &["goal_id"], &mut object);
                copy_numbers(text, &["daily_calories", "calories", "protein", "carbs", "fat"], &mut object);
            }
            CommandTag::GoalDelete => {
                copy_text(text, &["goal_id"], &mut object);
            }
            CommandTag::FoodLog => {
                copy_text(text, &["name", "unit", "meal_type"], &mut object);
                copy_numbers(text, &["amount"], &mut object);
                copy_numbers(text, MACRO_FIELDS, &mut object);
            }
            CommandTag::FoodIndex => {
                copy_text(text, &["name", "serving_unit"], &mut object);
                copy_numbers(text, &["serving_size"], &mut object);
                copy_numbers(text, MACRO_FIELDS, &mut object);
            }
        }

        object
    }
}

fn copy_text(text: &str, fields: &[&str], object: &mut Map<String, Value>) {
    for field in fields {
        let captured = TEXT_PATTERNS
            .get(*field)
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string());
        if let Some(value) = captured {
            object.insert(field.to_string(), Value::String(value));
        }
    }
}

fn copy_numbers(text: &str, fields: &[&str], object: &mut Map<String, Value>) {
    for field in fields {
        let captured = NUMBER_PATTERNS
            .get(*field)
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .and_then(Number::from_f64);
        if let Some(value) = captured {
            object.insert(field.to_string(), Value::Number(value));
        }
    }
}

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command markers the assistant may embed in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandTag {
    MealSuggestion,
    MealPlanGenerate,
    GoalModify,
    GoalDelete,
    FoodLog,
    FoodIndex,
}

impl CommandTag {
    pub const ALL: [CommandTag; 6] = [
        CommandTag::MealSuggestion,
        CommandTag::MealPlanGenerate,
        CommandTag::GoalModify,
        CommandTag::GoalDelete,
        CommandTag::FoodLog,
        CommandTag::FoodIndex,
    ];

    /// Marker text as it appears in a reply, without the trailing colon.
    pub fn marker(&self) -> &'static str {
        match self {
            CommandTag::MealSuggestion => "MEAL_SUGGESTION",
            CommandTag::MealPlanGenerate => "MEAL_PLAN_GENERATE",
            CommandTag::GoalModify => "GOAL_MODIFY",
            CommandTag::GoalDelete => "GOAL_DELETE",
            CommandTag::FoodLog => "FOOD_LOG",
            CommandTag::FoodIndex => "FOOD_INDEX",
        }
    }

    #[allow(dead_code)]
    pub fn from_marker(marker: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.marker() == marker)
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.marker())
    }
}

// Documented fallbacks for fields that cannot be recovered
pub const DEFAULT_MEAL_TYPE: &str = "dinner";
pub const DEFAULT_TIME_OF_DAY: &str = "evening";
pub const DEFAULT_PREFERENCE: &str = "balanced";
pub const DEFAULT_CALORIES: f64 = 600.0;
pub const DEFAULT_PROTEIN: f64 = 40.0;
pub const DEFAULT_CARBS: f64 = 50.0;
pub const DEFAULT_FAT: f64 = 20.0;
pub const DEFAULT_PLAN_DAYS: u32 = 7;
pub const DEFAULT_PLAN_STATUS: &str = "requested";
pub const DEFAULT_FOOD_NAME: &str = "Unknown food";
pub const DEFAULT_UNIT: &str = "serving";
pub const DEFAULT_LOG_MEAL_TYPE: &str = "snack";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Macros {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

impl Macros {
    pub fn meal_defaults() -> Self {
        Self {
            calories: DEFAULT_CALORIES,
            protein: DEFAULT_PROTEIN,
            carbs: DEFAULT_CARBS,
            fat: DEFAULT_FAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealSuggestionRequest {
    pub meal_type: String,
    pub time_of_day: String,
    pub preference: String,
    pub remaining_macros: Macros,
    /// Recently suggested meal names to steer away from
    #[serde(default)]
    pub avoid_meals: Vec<String>,
    /// Ingredients already covered in this conversation
    #[serde(default)]
    pub avoid_ingredients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanRequest {
    pub days: u32,
    pub status: String,
    pub preference: String,
}

/// Numeric targets the assistant asked to change. Absent values are left alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GoalUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_calories: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
}

impl GoalUpdates {
    pub fn is_empty(&self) -> bool {
        self.daily_calories.is_none()
            && self.protein.is_none()
            && self.carbs.is_none()
            && self.fat.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalModification {
    pub goal_id: String,
    pub updates: GoalUpdates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDeletion {
    pub goal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodLogEntry {
    pub name: String,
    pub amount: f64,
    pub unit: String,
    pub meal_type: String,
    pub macros: Macros,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodIndexItem {
    pub name: String,
    pub serving_size: f64,
    pub serving_unit: String,
    pub macros: Macros,
}

/// Typed arguments of a command, one variant per marker.
///
/// Every variant is built through [`RecoveredCommand::from_object`], which
/// fills any field it cannot read with the documented default, so a value of
/// this type always carries the full argument set for its command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecoveredCommand {
    MealSuggestion(MealSuggestionRequest),
    MealPlanGenerate(MealPlanRequest),
    GoalModify(GoalModification),
    GoalDelete(GoalDeletion),
    FoodLog(FoodLogEntry),
    FoodIndex(FoodIndexItem),
}

/// A recovered command together with the fields that fell back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub command: RecoveredCommand,
    pub defaulted: Vec<String>,
}

impl RecoveredCommand {
    pub fn tag(&self) -> CommandTag {
        match self {
            RecoveredCommand::MealSuggestion(_) => CommandTag::MealSuggestion,
            RecoveredCommand::MealPlanGenerate(_) => CommandTag::MealPlanGenerate,
            RecoveredCommand::GoalModify(_) => CommandTag::GoalModify,
            RecoveredCommand::GoalDelete(_) => CommandTag::GoalDelete,
            RecoveredCommand::FoodLog(_) => CommandTag::FoodLog,
            RecoveredCommand::FoodIndex(_) => CommandTag::FoodIndex,
        }
    }

    /// Build the typed command for `tag` from a recovered JSON object.
    pub fn from_object(tag: CommandTag, object: &Map<String, Value>) -> Recovery {
        let mut defaults = DefaultLog::new(tag);
        let command = match tag {
            CommandTag::MealSuggestion => {
                RecoveredCommand::MealSuggestion(meal_suggestion(object, &mut defaults))
            }
            CommandTag::MealPlanGenerate => {
                RecoveredCommand::MealPlanGenerate(meal_plan(object, &mut defaults))
            }
            CommandTag::GoalModify => RecoveredCommand::GoalModify(GoalModification {
                goal_id: defaults.text(text_field(object, "goal_id"), "goal_id", ""),
                updates: goal_updates(object),
            }),
            CommandTag::GoalDelete => RecoveredCommand::GoalDelete(GoalDeletion {
                goal_id: defaults.text(text_field(object, "goal_id"), "goal_id", ""),
            }),
            CommandTag::FoodLog => RecoveredCommand::FoodLog(food_log(object, &mut defaults)),
            CommandTag::FoodIndex => {
                RecoveredCommand::FoodIndex(food_index(object, &mut defaults))
            }
        };

        Recovery {
            command,
            defaulted: defaults.into_fields(),
        }
    }
}

fn meal_suggestion(object: &Map<String, Value>, defaults: &mut DefaultLog) -> MealSuggestionRequest {
    let macros = object_field(object, "remaining_macros").or_else(|| object_field(object, "macros"));
    let macro_value = |key: &str| {
        macros
            .and_then(|m| number_field(m, key))
            .or_else(|| number_field(object, key))
    };

    MealSuggestionRequest {
        meal_type: defaults.text(text_field(object, "meal_type"), "meal_type", DEFAULT_MEAL_TYPE),
        time_of_day: defaults.text(
            text_field(object, "time_of_day"),
            "time_of_day",
            DEFAULT_TIME_OF_DAY,
        ),
        preference: defaults.text(
            text_field(object, "preference"),
            "preference",
            DEFAULT_PREFERENCE,
        ),
        remaining_macros: Macros {
            calories: defaults.number(
                macro_value("calories"),
                "remaining_macros.calories",
                DEFAULT_CALORIES,
            ),
            protein: defaults.number(
                macro_value("protein"),
                "remaining_macros.protein",
                DEFAULT_PROTEIN,
            ),
            carbs: defaults.number(macro_value("carbs"), "remaining_macros.carbs", DEFAULT_CARBS),
            fat: defaults.number(macro_value("fat"), "remaining_macros.fat", DEFAULT_FAT),
        },
        avoid_meals: Vec::new(),
        avoid_ingredients: Vec::new(),
    }
}

fn meal_plan(object: &Map<String, Value>, defaults: &mut DefaultLog) -> MealPlanRequest {
    let days = defaults.number(number_field(object, "days"), "days", DEFAULT_PLAN_DAYS as f64);
    MealPlanRequest {
        days: days.round().max(1.0) as u32,
        status: defaults.text(text_field(object, "status"), "status", DEFAULT_PLAN_STATUS),
        preference: defaults.text(
            text_field(object, "preference"),
            "preference",
            DEFAULT_PREFERENCE,
        ),
    }
}

fn goal_updates(object: &Map<String, Value>) -> GoalUpdates {
    // Targets show up as `nutrition_targets: [{...}]`, an `updates` object, or flat keys
    let first_target = object
        .get("nutrition_targets")
        .and_then(|v| v.as_array())
        .and_then(|targets| targets.first())
        .and_then(|v| v.as_object());
    let updates = object_field(object, "updates");

    let lookup = |keys: &[&str]| {
        for source in [first_target, updates, Some(object)].into_iter().flatten() {
            for key in keys {
                if let Some(value) = number_field(source, key) {
                    return Some(value);
                }
            }
        }
        None
    };

    GoalUpdates {
        daily_calories: lookup(&["daily_calories", "calories"]),
        protein: lookup(&["protein", "protein_g"]),
        carbs: lookup(&["carbs", "carbs_g"]),
        fat: lookup(&["fat", "fat_g"]),
    }
}

fn food_macros(object: &Map<String, Value>, defaults: &mut DefaultLog) -> Macros {
    let nested = object_field(object, "macros").or_else(|| object_field(object, "nutrition"));
    let value = |key: &str| {
        nested
            .and_then(|m| number_field(m, key))
            .or_else(|| number_field(object, key))
    };
    Macros {
        calories: defaults.number(value("calories"), "calories", 0.0),
        protein: defaults.number(value("protein"), "protein", 0.0),
        carbs: defaults.number(value("carbs"), "carbs", 0.0),
        fat: defaults.number(value("fat"), "fat", 0.0),
    }
}

fn food_log(object: &Map<String, Value>, defaults: &mut DefaultLog) -> FoodLogEntry {
    FoodLogEntry {
        name: defaults.text(text_field(object, "name"), "name", DEFAULT_FOOD_NAME),
        amount: defaults.number(number_field(object, "amount"), "amount", 1.0),
        unit: defaults.text(text_field(object, "unit"), "unit", DEFAULT_UNIT),
        meal_type: defaults.text(
            text_field(object, "meal_type"),
            "meal_type",
            DEFAULT_LOG_MEAL_TYPE,
        ),
        macros: food_macros(object, defaults),
    }
}

fn food_index(object: &Map<String, Value>, defaults: &mut DefaultLog) -> FoodIndexItem {
    FoodIndexItem {
        name: defaults.text(text_field(object, "name"), "name", DEFAULT_FOOD_NAME),
        serving_size: defaults.number(number_field(object, "serving_size"), "serving_size", 1.0),
        serving_unit: defaults.text(
            text_field(object, "serving_unit"),
            "serving_unit",
            DEFAULT_UNIT,
        ),
        macros: food_macros(object, defaults),
    }
}

/// Tracks which fields were filled with a default while building a command.
struct DefaultLog {
    tag: CommandTag,
    fields: Vec<String>,
}

impl DefaultLog {
    fn new(tag: CommandTag) -> Self {
        Self { tag, fields: Vec::new() }
    }

    fn text(&mut self, found: Option<String>, field: &str, default: &str) -> String {
        match found {
            Some(value) => value,
            None => {
                self.record(field);
                default.to_string()
            }
        }
    }

    fn number(&mut self, found: Option<f64>, field: &str, default: f64) -> f64 {
        match found {
            Some(value) => value,
            None => {
                self.record(field);
                default
            }
        }
    }

    fn record(&mut self, field: &str) {
        debug!("{}: field '{}' not recovered, using default", self.tag, field);
        self.fields.push(field.to_string());
    }

    fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

/// Non-empty string value, or a number rendered as text.
pub fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric value; numeric strings such as `"40"` or `"40g"` are accepted.
pub fn number_field(object: &Map<String, Value>, key: &str) -> Option<f64> {
    match object.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_leading_number(s),
        _ => None,
    }
}

pub fn object_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    object.get(key).and_then(|v| v.as_object())
}

fn parse_leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().ok()
}

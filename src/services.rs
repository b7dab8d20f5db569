use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::command::{FoodIndexItem, FoodLogEntry, GoalUpdates, Macros, MealSuggestionRequest};

/// A meal proposed by the suggestion generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub name: String,
    pub serving_info: String,
    pub macros: Macros,
    pub description: String,
}

/// Goal storage owned by the surrounding application.
#[async_trait]
pub trait GoalService: Send + Sync {
    /// Apply `updates` to a goal; `false` when the goal does not exist for the user.
    async fn update_goal(&self, goal_id: &str, updates: &GoalUpdates, user_id: &str) -> Result<bool>;

    async fn delete_goal(&self, goal_id: &str, user_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait MealSuggestionGenerator: Send + Sync {
    async fn generate(&self, request: &MealSuggestionRequest) -> Result<Vec<Suggestion>>;
}

#[async_trait]
pub trait MealPlanService: Send + Sync {
    /// Human-readable status text for a plan, if there is anything to say.
    async fn meal_plan_info(&self, status: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait FoodLogService: Send + Sync {
    /// Store a food log entry and return its id.
    async fn log_food(&self, entry: &FoodLogEntry, user_id: &str) -> Result<String>;
}

#[async_trait]
pub trait FoodIndexService: Send + Sync {
    /// Add an item to the user's food index and return its id.
    async fn add_food(&self, item: &FoodIndexItem, user_id: &str) -> Result<String>;
}

/// The collaborators a dispatcher talks to.
#[derive(Clone)]
pub struct Services {
    pub goals: Arc<dyn GoalService>,
    pub meals: Arc<dyn MealSuggestionGenerator>,
    pub meal_plans: Arc<dyn MealPlanService>,
    pub food_log: Arc<dyn FoodLogService>,
    pub food_index: Arc<dyn FoodIndexService>,
}

impl Services {
    /// Use one backend for every collaborator.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: GoalService + MealSuggestionGenerator + MealPlanService + FoodLogService + FoodIndexService + 'static,
    {
        Self {
            goals: backend.clone(),
            meals: backend.clone(),
            meal_plans: backend.clone(),
            food_log: backend.clone(),
            food_index: backend,
        }
    }
}

struct CatalogMeal {
    name: &'static str,
    serving_info: &'static str,
    calories: f64,
    protein: f64,
    carbs: f64,
    fat: f64,
    description: &'static str,
    tags: &'static [&'static str],
}

const CATALOG: &[CatalogMeal] = &[
    CatalogMeal {
        name: "Grilled Chicken Quinoa Bowl",
        serving_info: "1 bowl (350g)",
        calories: 520.0,
        protein: 45.0,
        carbs: 48.0,
        fat: 14.0,
        description: "Grilled chicken breast over quinoa with roasted peppers and spinach.",
        tags: &["high-protein"],
    },
    CatalogMeal {
        name: "Baked Salmon with Sweet Potato",
        serving_info: "1 fillet (150g) + 1 medium potato",
        calories: 580.0,
        protein: 38.0,
        carbs: 45.0,
        fat: 22.0,
        description: "Oven-baked salmon with roasted sweet potato and steamed broccoli.",
        tags: &["high-protein"],
    },
    CatalogMeal {
        name: "Tofu Vegetable Stir-Fry",
        serving_info: "1 plate (300g) with 1 cup rice",
        calories: 470.0,
        protein: 24.0,
        carbs: 58.0,
        fat: 15.0,
        description: "Crispy tofu with broccoli, carrots and snap peas in a ginger soy sauce over rice.",
        tags: &["vegetarian", "vegan"],
    },
    CatalogMeal {
        name: "Turkey Lettuce Wraps",
        serving_info: "3 wraps",
        calories: 340.0,
        protein: 32.0,
        carbs: 12.0,
        fat: 17.0,
        description: "Lean ground turkey with water chestnuts and hoisin in butter lettuce cups.",
        tags: &["high-protein", "low-carb"],
    },
    CatalogMeal {
        name: "Lentil and Spinach Curry",
        serving_info: "1.5 cups",
        calories: 430.0,
        protein: 22.0,
        carbs: 60.0,
        fat: 10.0,
        description: "Red lentils simmered with spinach, tomato and coconut milk.",
        tags: &["vegetarian", "vegan"],
    },
    CatalogMeal {
        name: "Greek Yogurt Parfait",
        serving_info: "1 cup yogurt + 1/2 cup berries",
        calories: 280.0,
        protein: 24.0,
        carbs: 32.0,
        fat: 6.0,
        description: "Greek yogurt layered with berries, oats and a drizzle of honey.",
        tags: &["vegetarian", "high-protein"],
    },
    CatalogMeal {
        name: "Steak and Egg Salad",
        serving_info: "1 large bowl",
        calories: 510.0,
        protein: 42.0,
        carbs: 10.0,
        fat: 32.0,
        description: "Sliced sirloin steak and boiled egg over mixed greens with avocado.",
        tags: &["high-protein", "low-carb"],
    },
    CatalogMeal {
        name: "Black Bean Burrito Bowl",
        serving_info: "1 bowl (400g)",
        calories: 560.0,
        protein: 21.0,
        carbs: 82.0,
        fat: 14.0,
        description: "Black beans, brown rice, corn salsa and avocado with lime.",
        tags: &["vegetarian", "vegan"],
    },
];

const PREFERENCE_TAGS: &[&str] = &["vegan", "vegetarian", "high-protein", "low-carb"];

impl CatalogMeal {
    fn to_suggestion(&self) -> Suggestion {
        Suggestion {
            name: self.name.to_string(),
            serving_info: self.serving_info.to_string(),
            macros: Macros {
                calories: self.calories,
                protein: self.protein,
                carbs: self.carbs,
                fat: self.fat,
            },
            description: self.description.to_string(),
        }
    }

    fn mentions_any(&self, ingredients: &[String]) -> bool {
        let text = format!("{} {}", self.name, self.description).to_lowercase();
        ingredients.iter().any(|i| text.contains(&i.to_lowercase()))
    }
}

#[derive(Debug, Clone)]
struct StoredGoal {
    user_id: String,
    targets: GoalUpdates,
}

#[derive(Debug, Clone)]
struct StoredRecord<T> {
    id: String,
    user_id: String,
    item: T,
}

/// In-memory stand-in for the application's database and generators.
pub struct LocalBackend {
    goals: RwLock<HashMap<String, StoredGoal>>,
    food_log: RwLock<Vec<StoredRecord<FoodLogEntry>>>,
    food_index: RwLock<Vec<StoredRecord<FoodIndexItem>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            goals: RwLock::new(HashMap::new()),
            food_log: RwLock::new(Vec::new()),
            food_index: RwLock::new(Vec::new()),
        }
    }

    /// Register a goal so later updates and deletes can find it.
    pub async fn insert_goal(&self, goal_id: &str, user_id: &str, targets: GoalUpdates) {
        let mut goals = self.goals.write().await;
        goals.insert(
            goal_id.to_string(),
            StoredGoal {
                user_id: user_id.to_string(),
                targets,
            },
        );
    }

    #[allow(dead_code)]
    pub async fn goal(&self, goal_id: &str) -> Option<GoalUpdates> {
        self.goals.read().await.get(goal_id).map(|g| g.targets.clone())
    }

    #[allow(dead_code)]
    pub async fn logged_foods(&self, user_id: &str) -> Vec<FoodLogEntry> {
        self.food_log
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.item.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub async fn indexed_foods(&self, user_id: &str) -> Vec<(String, FoodIndexItem)> {
        self.food_index
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| (r.id.clone(), r.item.clone()))
            .collect()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GoalService for LocalBackend {
    async fn update_goal(&self, goal_id: &str, updates: &GoalUpdates, user_id: &str) -> Result<bool> {
        let mut goals = self.goals.write().await;
        match goals.get_mut(goal_id) {
            Some(goal) if goal.user_id == user_id => {
                let targets = &mut goal.targets;
                targets.daily_calories = updates.daily_calories.or(targets.daily_calories);
                targets.protein = updates.protein.or(targets.protein);
                targets.carbs = updates.carbs.or(targets.carbs);
                targets.fat = updates.fat.or(targets.fat);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_goal(&self, goal_id: &str, user_id: &str) -> Result<bool> {
        let mut goals = self.goals.write().await;
        let owned = goals.get(goal_id).is_some_and(|g| g.user_id == user_id);
        if owned {
            goals.remove(goal_id);
        }
        Ok(owned)
    }
}

#[async_trait]
impl MealSuggestionGenerator for LocalBackend {
    async fn generate(&self, request: &MealSuggestionRequest) -> Result<Vec<Suggestion>> {
        let preference = request.preference.to_lowercase();
        let wanted: Vec<&str> = PREFERENCE_TAGS
            .iter()
            .copied()
            .filter(|tag| preference.contains(tag))
            .collect();

        let mut candidates: Vec<&CatalogMeal> = CATALOG
            .iter()
            .filter(|meal| {
                !request
                    .avoid_meals
                    .iter()
                    .any(|avoid| avoid.eq_ignore_ascii_case(meal.name))
            })
            .collect();

        // Preferences narrow the list only when something still matches
        let preferred: Vec<&CatalogMeal> = candidates
            .iter()
            .copied()
            .filter(|meal| wanted.iter().all(|tag| meal.tags.contains(tag)))
            .collect();
        if !preferred.is_empty() {
            candidates = preferred;
        }

        let budget = request.remaining_macros.calories + 50.0;
        let fitting: Vec<&CatalogMeal> = candidates
            .iter()
            .copied()
            .filter(|meal| meal.calories <= budget)
            .collect();
        if !fitting.is_empty() {
            candidates = fitting;
        }

        let protein_target = request.remaining_macros.protein;
        candidates.sort_by(|a, b| {
            let repeat_a = a.mentions_any(&request.avoid_ingredients);
            let repeat_b = b.mentions_any(&request.avoid_ingredients);
            repeat_a.cmp(&repeat_b).then_with(|| {
                let gap_a = (a.protein - protein_target).abs();
                let gap_b = (b.protein - protein_target).abs();
                gap_a.total_cmp(&gap_b)
            })
        });

        debug!(
            "Generated {} local suggestions for {} ({})",
            candidates.len(),
            request.meal_type,
            request.preference
        );
        Ok(candidates.into_iter().take(5).map(CatalogMeal::to_suggestion).collect())
    }
}

#[async_trait]
impl MealPlanService for LocalBackend {
    async fn meal_plan_info(&self, status: &str) -> Result<Option<String>> {
        let info = match status.to_lowercase().as_str() {
            "completed" | "ready" => {
                Some("Your meal plan is ready. You can find it under Meal Plans.".to_string())
            }
            "in_progress" | "generating" => {
                Some("Your meal plan is still being put together. Check back in a minute.".to_string())
            }
            _ => None,
        };
        Ok(info)
    }
}

#[async_trait]
impl FoodLogService for LocalBackend {
    async fn log_food(&self, entry: &FoodLogEntry, user_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.food_log.write().await.push(StoredRecord {
            id: id.clone(),
            user_id: user_id.to_string(),
            item: entry.clone(),
        });
        Ok(id)
    }
}

#[async_trait]
impl FoodIndexService for LocalBackend {
    async fn add_food(&self, item: &FoodIndexItem, user_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.food_index.write().await.push(StoredRecord {
            id: id.clone(),
            user_id: user_id.to_string(),
            item: item.clone(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(preference: &str, calories: f64) -> MealSuggestionRequest {
        MealSuggestionRequest {
            meal_type: "dinner".to_string(),
            time_of_day: "evening".to_string(),
            preference: preference.to_string(),
            remaining_macros: Macros {
                calories,
                protein: 40.0,
                carbs: 50.0,
                fat: 20.0,
            },
            avoid_meals: Vec::new(),
            avoid_ingredients: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_goal_update_merges_targets() {
        let backend = LocalBackend::new();
        backend
            .insert_goal("g1", "u1", GoalUpdates { daily_calories: Some(2000.0), ..Default::default() })
            .await;

        let updates = GoalUpdates { protein: Some(150.0), ..Default::default() };
        assert!(backend.update_goal("g1", &updates, "u1").await.unwrap());
        let goal = backend.goal("g1").await.unwrap();
        assert_eq!(goal.daily_calories, Some(2000.0));
        assert_eq!(goal.protein, Some(150.0));

        // another user's goal is off limits
        assert!(!backend.update_goal("g1", &updates, "u2").await.unwrap());
        assert!(!backend.update_goal("missing", &updates, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_goal_delete() {
        let backend = LocalBackend::new();
        backend.insert_goal("g1", "u1", GoalUpdates::default()).await;
        assert!(!backend.delete_goal("g1", "u2").await.unwrap());
        assert!(backend.delete_goal("g1", "u1").await.unwrap());
        assert!(backend.goal("g1").await.is_none());
    }

    #[tokio::test]
    async fn test_suggestions_respect_preference_and_budget() {
        let backend = LocalBackend::new();
        let suggestions = backend.generate(&request("vegan", 500.0)).await.unwrap();
        assert!(!suggestions.is_empty());
        assert!(suggestions.iter().all(|s| s.macros.calories <= 550.0));
        assert!(suggestions.iter().any(|s| s.name == "Tofu Vegetable Stir-Fry"));
        assert!(suggestions.iter().all(|s| s.name != "Steak and Egg Salad"));
    }

    #[tokio::test]
    async fn test_suggestions_skip_recent_meals() {
        let backend = LocalBackend::new();
        let mut req = request("high-protein", 600.0);
        req.avoid_meals = vec!["grilled chicken quinoa bowl".to_string()];
        let suggestions = backend.generate(&req).await.unwrap();
        assert!(suggestions.iter().all(|s| s.name != "Grilled Chicken Quinoa Bowl"));
    }

    #[tokio::test]
    async fn test_suggestions_push_repeated_ingredients_back() {
        let backend = LocalBackend::new();
        let mut req = request("high-protein", 600.0);
        req.avoid_ingredients = vec!["chicken".to_string(), "salmon".to_string()];
        let suggestions = backend.generate(&req).await.unwrap();
        let first = &suggestions[0];
        assert!(!first.name.to_lowercase().contains("chicken"));
        assert!(!first.name.to_lowercase().contains("salmon"));
    }

    #[tokio::test]
    async fn test_food_records_are_per_user() {
        let backend = LocalBackend::new();
        let entry = FoodLogEntry {
            name: "banana".to_string(),
            amount: 1.0,
            unit: "medium".to_string(),
            meal_type: "snack".to_string(),
            macros: Macros::default(),
        };
        let id = backend.log_food(&entry, "u1").await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(backend.logged_foods("u1").await, vec![entry]);
        assert!(backend.logged_foods("u2").await.is_empty());
    }

    #[tokio::test]
    async fn test_meal_plan_info() {
        let backend = LocalBackend::new();
        assert!(backend.meal_plan_info("completed").await.unwrap().is_some());
        assert!(backend.meal_plan_info("requested").await.unwrap().is_none());
    }
}

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use log::{error, info};

use crate::command::{CommandTag, MealSuggestionRequest, RecoveredCommand, Recovery};
use crate::config::DispatchConfig;
use crate::context::ConversationStore;
use crate::event_bus::{Event, EventBus, EventEmitter};
use crate::fallback::FallbackExtractor;
use crate::impl_event_emitter;
use crate::repair::JsonRepairer;
use crate::scanner::{CommandMarker, CommandScanner};
use crate::services::{Services, Suggestion};

pub const GOAL_UPDATED: &str = "I've updated your goal.";
pub const GOAL_DELETED: &str = "I've deleted your goal.";
pub const NO_SUGGESTIONS: &str = "I couldn't find any meal suggestions that fit right now.";

/// Sentence substituted for a marker whose command could not be carried out.
pub fn apology(tag: CommandTag) -> &'static str {
    match tag {
        CommandTag::MealSuggestion => "I couldn't generate meal suggestions right now.",
        CommandTag::MealPlanGenerate => "I couldn't generate your meal plan.",
        CommandTag::GoalModify => "I couldn't update your goal.",
        CommandTag::GoalDelete => "I couldn't delete your goal.",
        CommandTag::FoodLog => "I couldn't log that food.",
        CommandTag::FoodIndex => "I couldn't add that food to your food index.",
    }
}

/// Carries out the commands embedded in an assistant reply.
///
/// Every marker is replaced by natural-language text describing what happened;
/// the rest of the reply is copied through untouched. Nothing in here fails
/// the chat turn: collaborator errors become an apology in place of the marker.
pub struct CommandDispatcher {
    services: Services,
    contexts: Arc<ConversationStore>,
    repairer: JsonRepairer,
    config: DispatchConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl CommandDispatcher {
    pub fn new(services: Services, contexts: Arc<ConversationStore>, config: DispatchConfig) -> Self {
        Self {
            services,
            contexts,
            repairer: JsonRepairer::new(),
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Rewrite `reply`, replacing each command marker with its outcome.
    pub async fn process(&self, reply: &str, user_id: &str) -> String {
        let mut output = String::with_capacity(reply.len());
        let mut cursor = 0;

        while let Some(marker) = CommandScanner::next_marker(reply, cursor) {
            output.push_str(&reply[cursor..marker.start]);
            let replacement = self.handle(reply, &marker, user_id).await;
            output.push_str(&replacement);
            cursor = marker.end;
        }

        output.push_str(&reply[cursor..]);
        output
    }

    /// Turn a payload into a complete command: repair first, scrape fields otherwise.
    pub async fn recover(&self, tag: CommandTag, payload: &str) -> Recovery {
        match self.repairer.repair(payload) {
            Ok(outcome) => {
                if outcome.was_repaired() {
                    let _ = self
                        .emit_event(Event::PayloadRepaired {
                            tag,
                            strategy: outcome.strategy,
                        })
                        .await;
                }
                RecoveredCommand::from_object(tag, &outcome.object)
            }
            Err(e) => {
                info!("{} payload could not be repaired: {}", tag, e);
                let recovery = FallbackExtractor::extract(tag, payload);
                let _ = self
                    .emit_event(Event::FallbackUsed {
                        tag,
                        defaulted: recovery.defaulted.clone(),
                    })
                    .await;
                recovery
            }
        }
    }

    async fn handle(&self, reply: &str, marker: &CommandMarker, user_id: &str) -> String {
        let tag = marker.tag;
        info!("Found {} command for user {}", tag, user_id);
        let _ = self
            .emit_event(Event::CommandDetected {
                tag,
                user_id: user_id.to_string(),
            })
            .await;

        let recovery = self.recover(tag, marker.payload(reply)).await;

        let text = match self.execute(recovery.command, user_id).await {
            Ok(text) => {
                let _ = self.emit_event(Event::CommandCompleted { tag }).await;
                text
            }
            Err(e) => {
                error!("{} command failed for user {}: {:#}", tag, user_id, e);
                let _ = self
                    .emit_event(Event::CommandFailed {
                        tag,
                        error: e.to_string(),
                    })
                    .await;
                apology(tag).to_string()
            }
        };

        if self.config.neutralize_markers {
            neutralize_markers(&text)
        } else {
            text
        }
    }

    async fn execute(&self, command: RecoveredCommand, user_id: &str) -> Result<String> {
        match command {
            RecoveredCommand::MealSuggestion(request) => self.suggest_meals(request, user_id).await,
            RecoveredCommand::MealPlanGenerate(plan) => {
                let info = self.services.meal_plans.meal_plan_info(&plan.status).await?;
                Ok(info.unwrap_or_else(|| {
                    format!("I've started generating your {}-day meal plan.", plan.days)
                }))
            }
            RecoveredCommand::GoalModify(modification) => {
                if modification.goal_id.is_empty() {
                    bail!("no goal_id in payload");
                }
                if modification.updates.is_empty() {
                    bail!("no numeric targets for goal {}", modification.goal_id);
                }
                let updated = self
                    .services
                    .goals
                    .update_goal(&modification.goal_id, &modification.updates, user_id)
                    .await?;
                if !updated {
                    return Err(anyhow!("goal {} was not updated", modification.goal_id));
                }
                Ok(GOAL_UPDATED.to_string())
            }
            RecoveredCommand::GoalDelete(deletion) => {
                if deletion.goal_id.is_empty() {
                    bail!("no goal_id in payload");
                }
                let deleted = self.services.goals.delete_goal(&deletion.goal_id, user_id).await?;
                if !deleted {
                    return Err(anyhow!("goal {} was not deleted", deletion.goal_id));
                }
                Ok(GOAL_DELETED.to_string())
            }
            RecoveredCommand::FoodLog(entry) => {
                let id = self.services.food_log.log_food(&entry, user_id).await?;
                info!("Logged {} as {}", entry.name, id);
                Ok(format!(
                    "I've logged {} {} of {} to your {}.",
                    format_amount(entry.amount),
                    entry.unit,
                    entry.name,
                    entry.meal_type
                ))
            }
            RecoveredCommand::FoodIndex(item) => {
                let id = self.services.food_index.add_food(&item, user_id).await?;
                info!("Indexed {} as {}", item.name, id);
                Ok(format!("I've added {} to your food index.", item.name))
            }
        }
    }

    async fn suggest_meals(&self, mut request: MealSuggestionRequest, user_id: &str) -> Result<String> {
        if request.meal_type.is_empty() || request.time_of_day.is_empty() {
            bail!("meal suggestion needs a meal_type and time_of_day");
        }

        // Held until the new suggestions are recorded so same-user turns queue up
        let mut context = self.contexts.lock(user_id).await;
        request.avoid_meals = context.recent_meal_names();
        request.avoid_ingredients = context.ingredients.iter().cloned().collect();

        let mut suggestions = self.services.meals.generate(&request).await?;
        suggestions.truncate(self.config.max_suggestions);
        if suggestions.is_empty() {
            return Ok(NO_SUGGESTIONS.to_string());
        }

        self.contexts.remember(&mut context, &suggestions).await;
        Ok(format_suggestions(&suggestions))
    }
}

impl_event_emitter!(CommandDispatcher);

/// Markdown bullet list, one meal per line.
pub fn format_suggestions(suggestions: &[Suggestion]) -> String {
    suggestions
        .iter()
        .map(|s| {
            let mut line = format!(
                "- **{}** ({}): {} kcal, {}g protein, {}g carbs, {}g fat.",
                s.name,
                s.serving_info,
                format_amount(s.macros.calories),
                format_amount(s.macros.protein),
                format_amount(s.macros.carbs),
                format_amount(s.macros.fat)
            );
            if !s.description.is_empty() {
                line.push(' ');
                line.push_str(&s.description);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One decimal at most, and none for whole numbers.
fn format_amount(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    format!("{}", rounded)
}

/// Break up `TAG:` sequences so substituted text never reads as a new command.
pub fn neutralize_markers(text: &str) -> String {
    let mut cleaned = text.to_string();
    for tag in CommandTag::ALL {
        let marker = format!("{}:", tag.marker());
        if cleaned.contains(&marker) {
            cleaned = cleaned.replace(&marker, &format!("{} -", tag.marker()));
        }
    }
    cleaned
}

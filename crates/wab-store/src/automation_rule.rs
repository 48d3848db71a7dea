//! Automation Rule Entity
//!
//! Tenant-scoped event→actions rules. The trigger selects the event
//! surface, the condition is typed per trigger, and the action list runs in
//! order with per-step continue-on-failure semantics. Execution counters
//! and the daily cap are persisted on the rule.

use async_trait::async_trait;
use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::MessageStatus;

pub const MAX_INLINE_DELAY_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    MessageReceived,
    StatusUpdated,
    CampaignCompleted,
    Keyword,
    TagAdded,
    AdLead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordMatchMode {
    Exact,
    Contains,
    StartsWith,
}

/// Condition predicate; shape depends on the trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum RuleCondition {
    /// Fires for every event of the trigger type.
    Always,
    /// Keyword triggers: inbound text matched against a keyword list.
    Keyword {
        keywords: Vec<String>,
        match_mode: KeywordMatchMode,
    },
    /// Status triggers: fires only for the given statuses.
    StatusIn { statuses: Vec<MessageStatus> },
    /// Tag triggers: fires only for the given tag.
    TagIs { tag: String },
}

impl RuleCondition {
    pub fn matches_keyword(&self, text: &str) -> bool {
        match self {
            RuleCondition::Keyword {
                keywords,
                match_mode,
            } => {
                let haystack = text.trim().to_lowercase();
                keywords.iter().any(|k| {
                    let needle = k.trim().to_lowercase();
                    if needle.is_empty() {
                        return false;
                    }
                    match match_mode {
                        KeywordMatchMode::Exact => haystack == needle,
                        KeywordMatchMode::Contains => haystack.contains(&needle),
                        KeywordMatchMode::StartsWith => haystack.starts_with(&needle),
                    }
                })
            }
            RuleCondition::Always => true,
            _ => false,
        }
    }

    pub fn matches_status(&self, status: MessageStatus) -> bool {
        match self {
            RuleCondition::StatusIn { statuses } => statuses.contains(&status),
            RuleCondition::Always => true,
            _ => false,
        }
    }

    pub fn matches_tag(&self, tag: &str) -> bool {
        match self {
            RuleCondition::TagIs { tag: expected } => expected == tag,
            RuleCondition::Always => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignStrategy {
    RoundRobin,
    LeastBusy,
    Specific,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Audio,
}

/// The automation action vocabulary. Session-window-gated actions (text and
/// media sends) are enforced by the engine at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum RuleAction {
    SendTemplateMessage {
        template_id: String,
        #[serde(default)]
        body_variables: Vec<String>,
    },
    SendTextMessage {
        text: String,
    },
    SendMediaMessage {
        media: MediaKind,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    AssignConversation {
        strategy: AssignStrategy,
        /// Roster for round-robin / least-busy; the specific agent for
        /// `Specific`.
        #[serde(default)]
        agents: Vec<String>,
    },
    AddTag {
        tag: String,
    },
    RemoveTag {
        tag: String,
    },
    MovePipelineStage {
        pipeline_id: String,
        stage_id: String,
    },
    CreateDeal {
        name: String,
        pipeline_id: String,
    },
    NotifyAgent {
        agent_id: String,
        message: String,
    },
    NotifyWebhook {
        url: String,
    },
    UpdateContact {
        field: String,
        value: String,
    },
    AddNote {
        text: String,
    },
    Delay {
        seconds: u64,
    },
    CloseConversation,
    MarkAsResolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    #[serde(flatten)]
    pub action: RuleAction,
    /// Whether a failure of this step aborts the rest of the list.
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    #[serde(rename = "_id")]
    pub id: String,

    pub tenant_id: String,

    pub name: String,

    pub trigger: TriggerKind,

    pub condition: RuleCondition,

    pub actions: Vec<ActionStep>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Max executions per day; 0 disables the cap.
    #[serde(default)]
    pub daily_cap: u32,

    #[serde(default)]
    pub executions_today: u32,

    /// Day key (`YYYY-MM-DD`) the daily counter belongs to.
    #[serde(default)]
    pub executions_day_key: String,

    #[serde(default)]
    pub success_count: u64,

    #[serde(default)]
    pub failure_count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl AutomationRule {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        trigger: TriggerKind,
        condition: RuleCondition,
        actions: Vec<ActionStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            trigger,
            condition,
            actions,
            enabled: true,
            daily_cap: 0,
            executions_today: 0,
            executions_day_key: String::new(),
            success_count: 0,
            failure_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the rule may run now under its daily cap. A stale day key
    /// means the counter belongs to a previous day and resets on record.
    pub fn under_daily_cap(&self, now: DateTime<Utc>) -> bool {
        if self.daily_cap == 0 {
            return true;
        }
        if self.executions_day_key != crate::workspace::day_key(now) {
            return true;
        }
        self.executions_today < self.daily_cap
    }
}

#[async_trait]
pub trait AutomationRuleRepository: Send + Sync {
    async fn insert(&self, rule: &AutomationRule) -> Result<()>;

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<AutomationRule>>;

    async fn list_enabled_by_trigger(
        &self,
        tenant_id: &str,
        trigger: TriggerKind,
    ) -> Result<Vec<AutomationRule>>;

    /// Count an execution: bump the day-window counter (resetting it when
    /// the day rolled over) plus the success/failure totals.
    async fn record_execution(
        &self,
        id: &str,
        success: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_enabled(&self, tenant_id: &str, id: &str, enabled: bool) -> Result<bool>;

    async fn delete_all_for_tenant(&self, tenant_id: &str) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_modes() {
        let condition = RuleCondition::Keyword {
            keywords: vec!["stop".into(), "Unsubscribe".into()],
            match_mode: KeywordMatchMode::Exact,
        };
        assert!(condition.matches_keyword("STOP"));
        assert!(condition.matches_keyword(" unsubscribe "));
        assert!(!condition.matches_keyword("please stop"));

        let contains = RuleCondition::Keyword {
            keywords: vec!["help".into()],
            match_mode: KeywordMatchMode::Contains,
        };
        assert!(contains.matches_keyword("I need HELP now"));

        let starts = RuleCondition::Keyword {
            keywords: vec!["order".into()],
            match_mode: KeywordMatchMode::StartsWith,
        };
        assert!(starts.matches_keyword("Order 1234"));
        assert!(!starts.matches_keyword("my order"));
    }

    #[test]
    fn status_condition() {
        let condition = RuleCondition::StatusIn {
            statuses: vec![MessageStatus::Failed],
        };
        assert!(condition.matches_status(MessageStatus::Failed));
        assert!(!condition.matches_status(MessageStatus::Delivered));
        assert!(RuleCondition::Always.matches_status(MessageStatus::Read));
    }

    #[test]
    fn daily_cap_window() {
        let now = Utc::now();
        let mut rule = AutomationRule::new(
            "t1",
            "welcome",
            TriggerKind::MessageReceived,
            RuleCondition::Always,
            Vec::new(),
        );
        assert!(rule.under_daily_cap(now));

        rule.daily_cap = 2;
        rule.executions_today = 2;
        rule.executions_day_key = crate::workspace::day_key(now);
        assert!(!rule.under_daily_cap(now));

        // Counter from a previous day does not block.
        rule.executions_day_key = "1999-01-01".into();
        assert!(rule.under_daily_cap(now));
    }
}

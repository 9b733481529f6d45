//! Ads platform mutation adapter.
//!
//! The only component allowed to perform outbound mutations. Building the
//! serialized request is shared between modes: dry-run returns it without
//! transmitting, live posts it to the platform.

pub mod live;
pub mod scripted;

pub use live::LiveAdsAdapter;
pub use scripted::ScriptedAdapter;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::models::{Action, EntityKind, EntityRef};

/// One platform mutation, fully serialized and ready to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
    pub customer_id: i64,
    pub resource: &'static str,
    pub operation: &'static str,
    pub entity_id: i64,
    pub fields: serde_json::Value,
}

/// Result of one adapter attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutcome {
    Ok { platform_ack: String },
    Transient { retry_after: Option<Duration> },
    Permanent { error_kind: String },
}

#[async_trait]
pub trait AdsApiAdapter: Send + Sync {
    /// Transmit one mutation and await the platform's answer.
    async fn apply(&self, request: &MutationRequest) -> AdapterOutcome;
}

fn to_micros(value: f64) -> i64 {
    (value * 1_000_000.0).round() as i64
}

/// The single conversion from a typed action to the platform's wire shape.
pub fn build_mutation(entity: &EntityRef, action: &Action) -> MutationRequest {
    match action {
        Action::AdjustBid { new_bid } => {
            let resource = match entity.entity_kind {
                EntityKind::AdGroup => "ad_group",
                _ => "ad_group_criterion",
            };
            MutationRequest {
                customer_id: entity.customer_id,
                resource,
                operation: "update",
                entity_id: entity.entity_id,
                fields: json!({ "cpc_bid_micros": to_micros(*new_bid) }),
            }
        }
        Action::AdjustBudget { new_budget } => MutationRequest {
            customer_id: entity.customer_id,
            resource: "campaign_budget",
            operation: "update",
            entity_id: entity.entity_id,
            fields: json!({ "amount_micros": to_micros(*new_budget) }),
        },
        Action::SetStatus { status } => {
            let resource = match entity.entity_kind {
                EntityKind::Campaign => "campaign",
                EntityKind::AdGroup => "ad_group",
                EntityKind::Keyword => "ad_group_criterion",
                EntityKind::Ad => "ad_group_ad",
                EntityKind::Product => "ad_group_criterion",
            };
            MutationRequest {
                customer_id: entity.customer_id,
                resource,
                operation: "update",
                entity_id: entity.entity_id,
                fields: json!({ "status": status.as_str() }),
            }
        }
        Action::AddNegative {
            keyword_text,
            match_type,
        } => MutationRequest {
            customer_id: entity.customer_id,
            resource: "campaign_criterion",
            operation: "create",
            entity_id: entity.entity_id,
            fields: json!({
                "negative": true,
                "keyword": { "text": keyword_text, "match_type": match_type.as_str() },
            }),
        },
        Action::ExcludeProduct { product_id } => MutationRequest {
            customer_id: entity.customer_id,
            resource: "ad_group_criterion",
            operation: "create",
            entity_id: entity.entity_id,
            fields: json!({
                "negative": true,
                "listing_group": { "product_id": product_id },
            }),
        },
    }
}

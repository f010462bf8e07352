//! Entitlement gating.
//!
//! The gate prices a content unit. It never looks at a balance: whether the
//! user can afford the price is decided by the unlock against the live
//! balance, inside the same transaction that debits it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::Credits;
use crate::catalog::Catalog;
use crate::ledger::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    /// Everything behind this policy is free.
    #[default]
    #[serde(alias = "free")]
    None,
    /// Flat `chapter_credits` per unit past the free threshold.
    PerUnit,
    /// Cost grows with distance past the free threshold.
    Progressive,
}

/// Engagement bonus tier: reaching `min_seconds` earns `credits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusTier {
    pub min_seconds: u64,
    pub credits: Credits,
}

pub fn default_bonus_tiers() -> Vec<BonusTier> {
    vec![
        BonusTier {
            min_seconds: 300,
            credits: Credits::new(1),
        },
        BonusTier {
            min_seconds: 600,
            credits: Credits::new(2),
        },
        BonusTier {
            min_seconds: 1800,
            credits: Credits::new(5),
        },
    ]
}

/// Pricing rules for a content unit, owned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default)]
    pub gate_type: GateType,
    /// Units at or below this 1-based position are free.
    #[serde(default)]
    pub free_threshold: u32,
    #[serde(default)]
    pub chapter_credits: Credits,
    #[serde(default = "one")]
    pub messages_per_credit: u32,
    /// Overrides the gate's default tiers when non-empty.
    #[serde(default)]
    pub bonus_tiers: Vec<BonusTier>,
}

fn one() -> u32 {
    1
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            gate_type: GateType::None,
            free_threshold: 0,
            chapter_credits: Credits::ZERO,
            messages_per_credit: 1,
            bonus_tiers: Vec::new(),
        }
    }
}

impl GatePolicy {
    pub fn per_unit(chapter_credits: Credits) -> Self {
        Self {
            gate_type: GateType::PerUnit,
            chapter_credits,
            ..Self::default()
        }
    }

    pub fn progressive(free_threshold: u32, messages_per_credit: u32) -> Self {
        Self {
            gate_type: GateType::Progressive,
            free_threshold,
            messages_per_credit,
            ..Self::default()
        }
    }

    pub fn with_free_threshold(mut self, free_threshold: u32) -> Self {
        self.free_threshold = free_threshold;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    NoGate,
    FreeUnit,
    WithinFreeThreshold,
    UnitPrice,
    ProgressivePrice,
}

/// Price of a content unit for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub must_pay: bool,
    pub credits_required: Credits,
    pub reason: GateReason,
}

impl GateDecision {
    fn free(reason: GateReason) -> Self {
        Self {
            must_pay: false,
            credits_required: Credits::ZERO,
            reason,
        }
    }

    fn priced(credits: Credits, reason: GateReason) -> Self {
        let credits = credits.max(Credits::ZERO);
        Self {
            must_pay: credits.is_positive(),
            credits_required: credits,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BonusEligibility {
    pub eligible: bool,
    pub bonus_credits: Credits,
}

/// Prices content units from catalog metadata.
#[derive(Debug)]
pub struct EntitlementGate<C> {
    catalog: Arc<C>,
    bonus_tiers: Vec<BonusTier>,
}

impl<C: Catalog> EntitlementGate<C> {
    pub fn new(catalog: Arc<C>, bonus_tiers: Vec<BonusTier>) -> Self {
        Self {
            catalog,
            bonus_tiers,
        }
    }

    /// Price `unit` at `progress_index` under `policy`.
    pub fn evaluate(
        &self,
        user: &str,
        unit: &str,
        progress_index: u32,
        policy: &GatePolicy,
    ) -> GateDecision {
        let decision = if policy.gate_type == GateType::None {
            GateDecision::free(GateReason::NoGate)
        } else if self.catalog.is_free_unit(unit) {
            GateDecision::free(GateReason::FreeUnit)
        } else if progress_index <= policy.free_threshold {
            GateDecision::free(GateReason::WithinFreeThreshold)
        } else {
            match policy.gate_type {
                GateType::PerUnit => {
                    GateDecision::priced(policy.chapter_credits, GateReason::UnitPrice)
                }
                GateType::Progressive => {
                    let past = progress_index - policy.free_threshold;
                    let cost = past.div_ceil(policy.messages_per_credit.max(1));
                    GateDecision::priced(
                        Credits::new(i64::from(cost)),
                        GateReason::ProgressivePrice,
                    )
                }
                GateType::None => GateDecision::free(GateReason::NoGate),
            }
        };

        debug!(
            user = %user,
            unit = %unit,
            progress_index,
            credits_required = %decision.credits_required,
            reason = ?decision.reason,
            "gate evaluated"
        );
        decision
    }

    /// Price a unit using the catalog's policy and position for it.
    pub fn quote(&self, user: &str, unit: &str) -> Result<GateDecision, LedgerError> {
        let not_found = || LedgerError::ContentNotFound(unit.to_string());
        let policy = self.catalog.gate_policy(unit).ok_or_else(not_found)?;
        let progress_index = self.catalog.progress_index(unit).ok_or_else(not_found)?;
        Ok(self.evaluate(user, unit, progress_index, &policy))
    }

    /// Highest tier reached under the default tiers.
    pub fn bonus_eligibility(&self, engagement_seconds: u64) -> BonusEligibility {
        highest_tier(&self.bonus_tiers, engagement_seconds)
    }

    /// Like [`bonus_eligibility`](Self::bonus_eligibility), honoring the
    /// unit's own tiers when its policy defines any.
    pub fn bonus_eligibility_for(
        &self,
        unit: &str,
        engagement_seconds: u64,
    ) -> Result<BonusEligibility, LedgerError> {
        let policy = self
            .catalog
            .gate_policy(unit)
            .ok_or_else(|| LedgerError::ContentNotFound(unit.to_string()))?;
        let tiers = if policy.bonus_tiers.is_empty() {
            &self.bonus_tiers
        } else {
            &policy.bonus_tiers
        };
        Ok(highest_tier(tiers, engagement_seconds))
    }
}

/// Tiers do not stack: only the best one reached pays out.
fn highest_tier(tiers: &[BonusTier], engagement_seconds: u64) -> BonusEligibility {
    let best = tiers
        .iter()
        .filter(|t| engagement_seconds >= t.min_seconds)
        .max_by_key(|t| (t.min_seconds, t.credits));
    match best {
        Some(tier) => BonusEligibility {
            eligible: tier.credits.is_positive(),
            bonus_credits: tier.credits,
        },
        None => BonusEligibility {
            eligible: false,
            bonus_credits: Credits::ZERO,
        },
    }
}

//! Signal-based personalization library.
//!
//! Deterministic variable derivation keyed on (industry group, strongest
//! signal) and the recipient's role level. No network calls — selection
//! is a stable hash over the recipient id, so the same recipient always
//! gets the same copy.

use crate::model::Recipient;
use crate::util::stable_pick;

/// The strongest enrichment signal available for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Active relevant job postings.
    Hiring,
    /// High intent score from visitor tracking.
    Intent,
    /// Known equipment footprint.
    Equipment,
    /// Nothing usable — fall back to industry-generic copy.
    None,
}

/// Coarse industry grouping used as the pain-library key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndustryGroup {
    Manufacturing,
    Logistics,
    Retail,
    FoodBeverage,
    General,
}

/// Seniority bucket inferred from the recipient's title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleLevel {
    CSuite,
    VpDirector,
    Manager,
    Engineer,
    Unknown,
}

pub fn strongest_signal(recipient: &Recipient) -> Signal {
    let postings = recipient
        .attributes
        .get("job_postings_count")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    if postings > 0 {
        return Signal::Hiring;
    }

    let intent = recipient
        .attributes
        .get("intent_score")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    if intent >= 70 {
        return Signal::Intent;
    }

    if recipient
        .attributes
        .get("equipment_signals")
        .is_some_and(|v| !v.trim().is_empty())
    {
        return Signal::Equipment;
    }

    Signal::None
}

pub fn industry_group(industry: &str) -> IndustryGroup {
    let industry = industry.to_lowercase();
    if industry.contains("manufactur") || industry.contains("industrial") {
        IndustryGroup::Manufacturing
    } else if industry.contains("logistic")
        || industry.contains("warehous")
        || industry.contains("distribution")
        || industry.contains("3pl")
        || industry.contains("transport")
    {
        IndustryGroup::Logistics
    } else if industry.contains("retail") || industry.contains("commerce") {
        IndustryGroup::Retail
    } else if industry.contains("food") || industry.contains("beverage") {
        IndustryGroup::FoodBeverage
    } else {
        IndustryGroup::General
    }
}

pub fn role_level(title: &str) -> RoleLevel {
    let title = title.to_lowercase();
    if title.contains("chief")
        || title.contains("ceo")
        || title.contains("coo")
        || title.contains("cfo")
        || title.contains("founder")
        || title.contains("president")
        || title.contains("owner")
    {
        RoleLevel::CSuite
    } else if title.contains("vp")
        || title.contains("vice president")
        || title.contains("director")
        || title.contains("head of")
    {
        RoleLevel::VpDirector
    } else if title.contains("manager") || title.contains("supervisor") {
        RoleLevel::Manager
    } else if title.contains("engineer") || title.contains("architect") {
        RoleLevel::Engineer
    } else {
        RoleLevel::Unknown
    }
}

// ── Copy tables ─────────────────────────────────────────────────────

fn opener_options(signal: Signal) -> &'static [&'static str] {
    match signal {
        Signal::Hiring => &[
            "Teams that are hiring for {role_area} roles usually feel the squeeze on fulfillment before headcount lands.",
            "Hiring into {role_area} is often the point where manual flows stop scaling for {industry} operations.",
        ],
        Signal::Intent => &[
            "A lot of {industry} teams start evaluating automation right when order profiles shift under them.",
            "When {industry} operators start comparing systems, the spread between quotes usually comes down to throughput assumptions.",
        ],
        Signal::Equipment => &[
            "Facilities running {equipment} tend to hit a ceiling where storage density and pick rates start trading against each other.",
            "Sites built around {equipment} often have more throughput locked up in slotting than in the hardware itself.",
        ],
        Signal::None => &[
            "Most {industry} operations we talk to are balancing throughput targets against space they can't expand.",
            "Growth in {industry} tends to surface the same bottleneck: the handoff between storage and picking.",
        ],
    }
}

fn pain_options(group: IndustryGroup, role: RoleLevel) -> &'static [&'static str] {
    match (group, role) {
        (IndustryGroup::Logistics, RoleLevel::CSuite) => &[
            "Margin in fulfillment usually erodes at the dock doors and the pick face, not in the P&L lines anyone watches.",
            "Throughput ceilings show up as overtime spend long before they show up as missed SLAs.",
        ],
        (IndustryGroup::Logistics, _) => &[
            "Pick rates usually stall where storage and picking exchange materials.",
            "Wave planning can only hide slotting problems for so long before travel time dominates the shift.",
        ],
        (IndustryGroup::Manufacturing, RoleLevel::CSuite) => &[
            "Line-side replenishment is where most plants quietly lose a shift's worth of output a week.",
            "WIP buffers tend to grow until they become the constraint nobody scheduled.",
        ],
        (IndustryGroup::Manufacturing, _) => &[
            "Material handling between cells is usually the least-measured step with the most variance.",
            "Kitting delays compound downstream faster than any single station slowdown.",
        ],
        (IndustryGroup::Retail | IndustryGroup::FoodBeverage, _) => &[
            "Order profiles keep shifting toward smaller, more frequent picks, and fixed racking fights that trend.",
            "Seasonal peaks expose the gap between rated capacity and achievable capacity.",
        ],
        (IndustryGroup::General, _) => &[
            "Throughput often tightens where storage and picking exchange materials.",
            "Labor availability sets the real ceiling more often than equipment does.",
        ],
    }
}

fn credibility_options(signal: Signal) -> &'static [&'static str] {
    match signal {
        Signal::Hiring => &[
            "We've helped teams in the middle of a hiring push get 20–30% more throughput from the same headcount.",
            "Operators we work with have deferred seasonal hires by tightening pick paths instead.",
        ],
        Signal::Equipment => &[
            "We design and integrate around {equipment} daily, so recommendations come with real install numbers behind them.",
            "Most of our recent projects started with exactly this equipment mix.",
        ],
        Signal::Intent | Signal::None => &[
            "We've delivered systems for operations from 20k to 500k square feet, so the comparison points are current.",
            "Our engineers benchmark designs against live installs, not vendor datasheets.",
        ],
    }
}

/// Derived variables for a recipient: (opener, pain statement, credibility anchor).
pub fn derive(recipient: &Recipient) -> (String, String, String) {
    let signal = strongest_signal(recipient);
    let group = industry_group(&recipient.industry);
    let role = role_level(&recipient.title);

    let industry_text = if recipient.industry.trim().is_empty() {
        "operations".to_string()
    } else {
        recipient.industry.trim().to_lowercase()
    };
    let equipment = recipient
        .attributes
        .get("equipment_signals")
        .cloned()
        .unwrap_or_else(|| "conveyor and racking".to_string());
    let role_area = if recipient.title.trim().is_empty() {
        "operations".to_string()
    } else {
        recipient.title.trim().to_lowercase()
    };

    let openers = opener_options(signal);
    let opener = openers[stable_pick(&format!("{}:opener", recipient.id), openers.len())]
        .replace("{industry}", &industry_text)
        .replace("{equipment}", &equipment)
        .replace("{role_area}", &role_area);

    let pains = pain_options(group, role);
    let pain = pains[stable_pick(&format!("{}:pain", recipient.id), pains.len())].to_string();

    let anchors = credibility_options(signal);
    let credibility = anchors[stable_pick(&format!("{}:cred", recipient.id), anchors.len())]
        .replace("{equipment}", &equipment);

    (opener, pain, credibility)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn recipient(industry: &str, title: &str, attrs: &[(&str, &str)]) -> Recipient {
        Recipient {
            id: "r-1".into(),
            first_name: "Mia".into(),
            last_name: "Chen".into(),
            email: "mia@acme.test".into(),
            title: title.into(),
            phone: None,
            network_url: None,
            company: "Acme".into(),
            industry: industry.into(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn hiring_beats_other_signals() {
        let r = recipient(
            "Logistics",
            "COO",
            &[("job_postings_count", "4"), ("intent_score", "90")],
        );
        assert_eq!(strongest_signal(&r), Signal::Hiring);
    }

    #[test]
    fn intent_requires_threshold() {
        let r = recipient("Logistics", "COO", &[("intent_score", "69")]);
        assert_eq!(strongest_signal(&r), Signal::None);
        let r = recipient("Logistics", "COO", &[("intent_score", "70")]);
        assert_eq!(strongest_signal(&r), Signal::Intent);
    }

    #[test]
    fn industry_grouping() {
        assert_eq!(industry_group("Third-Party Logistics"), IndustryGroup::Logistics);
        assert_eq!(industry_group("Food & Beverage"), IndustryGroup::FoodBeverage);
        assert_eq!(industry_group("Software"), IndustryGroup::General);
    }

    #[test]
    fn role_levels() {
        assert_eq!(role_level("Chief Operating Officer"), RoleLevel::CSuite);
        assert_eq!(role_level("VP of Operations"), RoleLevel::VpDirector);
        assert_eq!(role_level("Warehouse Manager"), RoleLevel::Manager);
        assert_eq!(role_level("Controls Engineer"), RoleLevel::Engineer);
        assert_eq!(role_level(""), RoleLevel::Unknown);
    }

    #[test]
    fn derive_is_deterministic_and_fills_placeholders() {
        let r = recipient(
            "Warehousing",
            "Director of Operations",
            &[("equipment_signals", "pallet shuttles")],
        );
        let first = derive(&r);
        let second = derive(&r);
        assert_eq!(first, second);
        assert!(!first.0.contains("{industry}"));
        assert!(!first.0.contains("{equipment}"));
        assert!(!first.2.contains("{equipment}"));
    }
}

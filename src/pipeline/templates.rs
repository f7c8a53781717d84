//! Templated replies for the itinerary workflow paths.
//!
//! These are rendered locally and cost nothing; only [`DraftKind::Fallback`]
//! needs the model.

use std::fmt::Write as _;

use rust_decimal::Decimal;

use crate::matching::MatchSummary;
use crate::pipeline::types::{DraftContext, DraftKind, DraftedResponse};

/// Render a templated reply, or `None` for kinds that need the drafter.
pub fn render(kind: DraftKind, ctx: &DraftContext<'_>) -> Option<DraftedResponse> {
    let greeting = format!("Dear {},", recipient_name(ctx));
    let paragraphs: Vec<String> = match kind {
        DraftKind::RequestMoreInfo => {
            let missing: Vec<&str> = ctx
                .extracted
                .map(|data| data.missing_fields())
                .unwrap_or_default()
                .into_iter()
                .map(field_label)
                .collect();
            let mut p = vec![
                "Thank you for your enquiry. To put together the right options for you, could you tell us a little more?".to_string(),
            ];
            if !missing.is_empty() {
                p.push(format!("We still need: {}.", missing.join(", ")));
            }
            if let Some(reason) = ctx.reason {
                p.push(reason.to_string());
            }
            p
        }
        DraftKind::GoodMatches => {
            let mut p = vec!["Thank you for your enquiry. We found these packages that fit your request well:".to_string()];
            p.extend(ctx.matches.iter().map(|m| match_line(m, false)));
            p.push("Reply to this email and we will hold your preferred option.".to_string());
            p
        }
        DraftKind::ModerateMatches => {
            let mut p = vec!["Thank you for your enquiry. These packages come close to what you asked for, with a few differences noted:".to_string()];
            p.extend(ctx.matches.iter().map(|m| match_line(m, true)));
            p.push("If none of these suit, we are happy to build something tailored.".to_string());
            p
        }
        DraftKind::CustomRequest => vec![
            "Thank you for your enquiry. Your request calls for a tailored itinerary, so we have passed it to one of our travel specialists.".to_string(),
            "They will be in touch shortly with a proposal.".to_string(),
        ],
        DraftKind::Fallback => return None,
    };

    let plain_text = std::iter::once(greeting.clone())
        .chain(paragraphs.iter().cloned())
        .chain(std::iter::once("Kind regards,\nThe Travel Team".to_string()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut body = String::new();
    let _ = write!(body, "<p>{}</p>", escape(&greeting));
    for p in &paragraphs {
        let _ = write!(body, "<p>{}</p>", escape(p));
    }
    body.push_str("<p>Kind regards,<br>The Travel Team</p>");

    Some(DraftedResponse {
        kind,
        subject: reply_subject(ctx),
        body,
        plain_text,
        cost: Decimal::ZERO,
    })
}

pub fn reply_subject(ctx: &DraftContext<'_>) -> String {
    match ctx.message.subject.as_deref().map(str::trim) {
        Some(s) if s.to_ascii_lowercase().starts_with("re:") => s.to_string(),
        Some(s) if !s.is_empty() => format!("Re: {s}"),
        _ => "Your travel enquiry".to_string(),
    }
}

fn recipient_name(ctx: &DraftContext<'_>) -> String {
    ctx.extracted
        .and_then(|data| data.contact.name.clone())
        .or_else(|| ctx.message.sender_name.clone())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "traveller".to_string())
}

fn match_line(m: &MatchSummary, with_gaps: bool) -> String {
    let mut line = format!("• {} ({})", m.title, m.destination);
    if let Some(price) = m.price {
        let _ = write!(line, ", from {}", price.round_dp(2));
    }
    if !m.reasons.is_empty() {
        let _ = write!(line, ". {}", m.reasons.join("; "));
    }
    if with_gaps && !m.gaps.is_empty() {
        let _ = write!(line, ". Note: {}", m.gaps.join("; "));
    }
    line
}

fn field_label(field: &str) -> &str {
    match field {
        "destination" => "your destination",
        "travel_dates" => "your travel dates",
        "budget" => "your budget",
        "travelers" => "the number of travellers",
        "contact_name" => "your name",
        "contact_method" => "a phone number or email address",
        other => other,
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("<br>"),
            c => out.push(c),
        }
    }
    out
}

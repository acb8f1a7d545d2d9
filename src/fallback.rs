//! Canned replies used while the assistant socket is not open.

pub const GENERIC_REPLY: &str = "Thanks for your message! Our team will get back to you shortly. \
In the meantime, feel free to ask about our services, pricing, or how to get in touch.";

pub const GREETING_REPLY: &str =
    "Hello! Welcome. How can I help you today? You can ask about our services, pricing, or contact details.";
pub const SERVICES_REPLY: &str = "We offer custom software development, web and mobile apps, \
ERP/CRM implementation, cloud migration and company registration support for startups.";
pub const PRICING_REPLY: &str = "Pricing depends on project scope. Share a few details about what \
you need and we will prepare a free, no-obligation quote.";
pub const CONTACT_REPLY: &str = "You can reach us through the contact form on this page, or leave \
your email here and a member of our team will contact you within one business day.";
pub const ERP_CRM_REPLY: &str = "We implement and customize ERP and CRM systems, including data \
migration, integrations and staff training. Which system are you interested in?";
pub const STARTUP_REPLY: &str = "We help startups with company registration, compliance paperwork \
and the first version of their product. Would you like to know more about the registration process?";

/// Groups are checked in order; the first match wins. Single words match
/// whole words only, entries with a space match as phrases.
const KEYWORD_GROUPS: &[(&[&str], &str)] = &[
    (
        &["hello", "hi", "hey", "greetings", "good morning", "good afternoon", "good evening"],
        GREETING_REPLY,
    ),
    (
        &["service", "services", "offer", "offering", "development", "what do you do"],
        SERVICES_REPLY,
    ),
    (
        &["price", "prices", "pricing", "cost", "costs", "quote", "budget", "how much", "rate", "rates"],
        PRICING_REPLY,
    ),
    (
        &["contact", "email", "phone", "call", "reach", "address", "talk to"],
        CONTACT_REPLY,
    ),
    (&["erp", "crm", "odoo", "salesforce"], ERP_CRM_REPLY),
    (
        &["startup", "startups", "registration", "register", "incorporate", "company formation"],
        STARTUP_REPLY,
    ),
];

/// Lowercase, replace punctuation with spaces, collapse whitespace.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

fn matches(normalized: &str, words: &[&str], keyword: &str) -> bool {
    if keyword.contains(' ') {
        // Pad so phrases only match on word boundaries.
        format!(" {} ", normalized).contains(&format!(" {} ", keyword))
    } else {
        words.iter().any(|w| *w == keyword)
    }
}

/// First matching canned reply, or the generic acknowledgment.
pub fn canned_reply(text: &str) -> &'static str {
    let normalized = normalize(text);
    let words: Vec<&str> = normalized.split(' ').collect();
    KEYWORD_GROUPS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| matches(&normalized, &words, k)))
        .map(|(_, reply)| *reply)
        .unwrap_or(GENERIC_REPLY)
}

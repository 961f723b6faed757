//! Confirmation script rendering

use crate::orders::OrderItem;

/// Items read out individually; the rest are summarised as a count
const SPOKEN_ITEM_LIMIT: usize = 3;

const GREETINGS: [(&str, &str); 13] = [
    ("en", "Hello"),
    ("es", "Hola"),
    ("fr", "Bonjour"),
    ("de", "Hallo"),
    ("it", "Ciao"),
    ("pt", "Olá"),
    ("ru", "Привет"),
    ("zh", "你好"),
    ("ja", "こんにちは"),
    ("ko", "안녕하세요"),
    ("ar", "مرحبا"),
    ("hi", "नमस्ते"),
    ("ur", "السلام علیکم"),
];

/// Greeting for a language code, English when unsupported
pub fn greeting_for(language: &str) -> &'static str {
    GREETINGS
        .iter()
        .find(|(code, _)| *code == language)
        .map(|(_, greeting)| *greeting)
        .unwrap_or("Hello")
}

pub fn is_supported_language(language: &str) -> bool {
    GREETINGS.iter().any(|(code, _)| *code == language)
}

/// Replace a leading "Hello" with the language's greeting
pub fn localize_greeting(script: &str, language: &str) -> String {
    match script.strip_prefix("Hello") {
        Some(rest) => format!("{}{}", greeting_for(language), rest),
        None => script.to_string(),
    }
}

fn items_summary(items: &[OrderItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let spoken: Vec<String> = items
        .iter()
        .take(SPOKEN_ITEM_LIMIT)
        .map(|item| format!("{} {}", item.quantity, item.name))
        .collect();

    let mut summary = format!(" including {}", spoken.join(", "));
    if items.len() > SPOKEN_ITEM_LIMIT {
        summary.push_str(&format!(" and {} more items", items.len() - SPOKEN_ITEM_LIMIT));
    }
    summary
}

/// Script the voice agent reads to the customer, already localised
pub fn render_confirmation_script(
    customer_name: &str,
    external_order_id: &str,
    total: f64,
    currency: &str,
    items: &[OrderItem],
    language: &str,
) -> String {
    let script = format!(
        "Hello {customer_name}, this is a call from VoiceConfirm regarding your recent order #{external_order_id}.\n\n\
         I'm calling to confirm your order totaling {total:.2} {currency}{items}.\n\n\
         Could you please confirm that you placed this order and that all the details are correct?\n\n\
         If you confirm this order, please say 'yes' or 'confirm'. If there are any issues or you need to cancel, please say 'no' or 'cancel'.\n\n\
         Thank you for your time.",
        items = items_summary(items),
    );
    localize_greeting(&script, language)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, quantity: u32) -> OrderItem {
        OrderItem {
            name: name.to_string(),
            quantity,
            price: 1.0,
        }
    }

    #[test]
    fn test_script_lists_three_items_then_counts_the_rest() {
        let items = vec![item("Lamp", 2), item("Mug", 1), item("Rug", 1), item("Vase", 3), item("Pen", 9)];
        let script = render_confirmation_script("Ana", "1001", 42.5, "EUR", &items, "en");

        assert!(script.starts_with("Hello Ana, this is a call from VoiceConfirm regarding your recent order #1001."));
        assert!(script.contains("totaling 42.50 EUR including 2 Lamp, 1 Mug, 1 Rug and 2 more items."));
        assert!(!script.contains("Vase"));
        assert!(script.ends_with("Thank you for your time."));
    }

    #[test]
    fn test_script_without_items() {
        let script = render_confirmation_script("Bo", "7", 10.0, "USD", &[], "en");
        assert!(script.contains("totaling 10.00 USD.\n"));
    }

    #[test]
    fn test_greeting_is_localised_with_english_fallback() {
        let script = render_confirmation_script("Luis", "9", 5.0, "MXN", &[], "es");
        assert!(script.starts_with("Hola Luis"));

        assert_eq!(localize_greeting("Hello there", "ja"), "こんにちは there");
        assert_eq!(localize_greeting("Hello there", "xx"), "Hello there");
        assert_eq!(localize_greeting("Hi there", "fr"), "Hi there");
        assert!(is_supported_language("ur"));
        assert!(!is_supported_language("nl"));
    }
}

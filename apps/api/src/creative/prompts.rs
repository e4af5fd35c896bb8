// Image prompt construction for segmentation/location pairs.
// Deterministic: the same pair always yields the same prompt.

use crate::models::segmentation::SegmentationLocationPair;

const BASE_PROMPT: &str = "A clean, modern e-commerce marketing banner photograph. \
    No text, no logos, no watermarks. Natural lighting, product-focused composition.";

/// Maps one label facet (e.g. `giftWrapYes`) to a visual direction.
fn facet_direction(facet: &str) -> Option<&'static str> {
    match facet {
        "session2EventCountHigh" => Some("energetic, browsing-rich scene with many products on display"),
        "session2EventCountLow" => Some("calm, minimal scene with a single hero product"),
        "session2OrderCountHigh" => Some("loyal repeat shopper vibe, well-stocked shopping bags"),
        "totalSpentHigh" => Some("premium, luxurious styling with elegant materials"),
        "totalSpentMedium" => Some("stylish mid-range look"),
        "totalSpentLow" => Some("friendly, affordable everyday feel"),
        "giftWrapYes" => Some("beautifully gift-wrapped boxes with ribbons"),
        "shoppingCartAbandonmentYes" => Some("inviting reminder of items waiting in a shopping cart"),
        "differentLocationYes" => Some("travel mood, suitcase and souvenirs"),
        _ => None,
    }
}

pub fn build_image_prompt(pair: &SegmentationLocationPair) -> String {
    let directions: Vec<&str> = pair
        .segment_label
        .split('-')
        .filter_map(facet_direction)
        .collect();

    let mut prompt = format!(
        "{BASE_PROMPT} Setting: {}, {}, with recognizable local atmosphere.",
        pair.city, pair.country
    );
    if !directions.is_empty() {
        prompt.push_str(" Mood: ");
        prompt.push_str(&directions.join("; "));
        prompt.push('.');
    }
    prompt
}

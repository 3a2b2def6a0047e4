use taskdeck_protocol::{MessagePart, PartKind};

/// Cheap change signature for an updatable part.
///
/// Tool parts combine execution status, part kind, output length and text
/// length; text and reasoning parts use the text length alone. Question and
/// todo parts are tool calls underneath and are fingerprinted as such.
/// Distinct contents with equal lengths and status collide.
pub fn fingerprint(part: &MessagePart) -> Option<String> {
    let text_len = part.text.as_deref().map(char_len).unwrap_or(0);
    match (part.kind, part.tool.as_ref()) {
        (PartKind::Text | PartKind::Reasoning, _) => Some(text_len.to_string()),
        (PartKind::Tool | PartKind::Question | PartKind::TodoWrite, Some(tool)) => {
            let output_len = tool.output.as_deref().map(char_len).unwrap_or(0);
            Some(format!(
                "{}:{}:{output_len}:{text_len}",
                tool.status.as_str(),
                part.kind.as_str()
            ))
        }
        _ => None,
    }
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

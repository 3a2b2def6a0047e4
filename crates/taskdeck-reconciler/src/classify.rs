use serde::Deserialize;
use serde_json::Value;
use taskdeck_protocol::{MessagePart, PartKind, QuestionPrompt, TodoItem, ToolInteraction};

#[derive(Debug, Default, Deserialize)]
struct InteractiveInput {
    #[serde(default)]
    questions: Option<Value>,
    #[serde(default)]
    todos: Option<Value>,
}

/// Classifies a tool call by the shape of its input.
///
/// A non-empty `questions` list wins over a non-empty `todos` list. Inputs
/// that fail to decode, or lists whose entries fail to decode, classify as a
/// plain tool call. String inputs are decoded as embedded JSON first.
pub fn classify_tool_input(input: &Value) -> ToolInteraction {
    let decoded = match input {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(_) => return ToolInteraction::Tool,
        },
        other => other.clone(),
    };
    let Ok(shape) = serde_json::from_value::<InteractiveInput>(decoded) else {
        return ToolInteraction::Tool;
    };

    if let Some(questions) = shape.questions.and_then(decode_list::<QuestionPrompt>) {
        return ToolInteraction::Question(questions);
    }
    if let Some(todos) = shape.todos.and_then(decode_list::<TodoItem>) {
        return ToolInteraction::Todo(todos);
    }
    ToolInteraction::Tool
}

/// Returns a copy of `part` with its effective kind and interaction set.
/// Non-tool parts are returned unchanged.
pub fn classify_part(part: &MessagePart) -> MessagePart {
    let mut classified = part.clone();
    if part.kind != PartKind::Tool {
        return classified;
    }
    if let Some(tool) = classified.tool.as_mut() {
        tool.interaction = classify_tool_input(&tool.input);
        classified.kind = tool.interaction.part_kind();
    }
    classified
}

fn decode_list<T>(value: Value) -> Option<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
{
    let items = serde_json::from_value::<Vec<T>>(value).ok()?;
    (!items.is_empty()).then_some(items)
}

mod bridge;
mod command_registry;
mod intent_parser;

pub use bridge::{
    apply_function_call, is_valid_aspect_ratio, ChatAction, ChatControls, ChatOutcome,
    FunctionCall, ART_STYLES, CFG_SCALE_MAX, CFG_SCALE_MIN, CONCEPTS,
};
pub use command_registry::CHAT_HELP_COMMANDS;
pub use intent_parser::{parse_intent, Intent};

use serde_json::{Map, Value};

use super::bridge::FunctionCall;
use super::command_registry::{CommandSpec, ARG_COMMANDS, BRIDGE_FUNCTIONS, NO_ARG_COMMANDS};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub command_args: Map<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: Map::new(),
        }
    }

    /// The bridge call this intent maps to, if any. Session actions such as
    /// `start_evolution` and `help` are handled by the caller.
    pub fn function_call(&self) -> Option<FunctionCall> {
        if !BRIDGE_FUNCTIONS.contains(&self.action.as_str()) {
            return None;
        }
        Some(FunctionCall {
            name: self.action.clone(),
            args: self.command_args.clone(),
        })
    }
}

fn find_spec<'a>(command: &str, specs: &'a [CommandSpec]) -> Option<&'a CommandSpec> {
    specs.iter().find(|spec| spec.command == command)
}

/// Joins shell-style words so quoted arguments lose their quotes.
fn normalize_arg(arg: &str) -> String {
    match shell_words::split(arg) {
        Ok(parts) => parts.join(" "),
        Err(_) => arg.trim().to_string(),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                if let Some(key) = spec.arg {
                    intent
                        .command_args
                        .insert(key.to_string(), Value::String(normalize_arg(arg)));
                }
                return intent;
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("set_theme", text);
    intent
        .command_args
        .insert("theme".to_string(), Value::String(raw_trimmed.to_string()));
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_sets_theme() {
        let intent = parse_intent("  Cosmic jellyfish ballet ");
        assert_eq!(intent.action, "set_theme");
        assert_eq!(intent.command_args["theme"], json!("Cosmic jellyfish ballet"));
        let call = intent.function_call().unwrap_or_else(|| panic!("no call"));
        assert_eq!(call.name, "set_theme");
    }

    #[test]
    fn argument_commands_capture_remainder() {
        let style = parse_intent("/style \"Art Nouveau\" poster");
        assert_eq!(style.action, "set_art_style");
        assert_eq!(style.command_args["art_style"], json!("Art Nouveau poster"));

        let cfg = parse_intent("/CFG 7.5");
        assert_eq!(cfg.action, "set_cfg_scale");
        assert_eq!(cfg.command_args["cfg_scale"], json!("7.5"));

        let aspect = parse_intent("/aspect 16:9");
        assert_eq!(aspect.command_args["aspect_ratio"], json!("16:9"));
    }

    #[test]
    fn session_commands_have_no_function_call() {
        let start = parse_intent("/start");
        assert_eq!(start.action, "start_evolution");
        assert!(start.function_call().is_none());
        assert_eq!(parse_intent("/stop").action, "stop_evolution");
        assert_eq!(parse_intent("/help").action, "help");

        let generate = parse_intent("/generate");
        assert_eq!(
            generate.function_call().map(|call| call.name),
            Some("generate_image_now".to_string())
        );
    }

    #[test]
    fn unknown_and_empty_input() {
        let unknown = parse_intent("/magic foo bar");
        assert_eq!(unknown.action, "unknown");
        assert_eq!(unknown.command_args["command"], json!("magic"));
        assert_eq!(unknown.command_args["arg"], json!("foo bar"));
        assert_eq!(parse_intent("   ").action, "noop");
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    /// Argument key the remainder of the line is stored under.
    pub arg: Option<&'static str>,
}

pub(crate) const ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "style",
        action: "set_art_style",
        arg: Some("art_style"),
    },
    CommandSpec {
        command: "negative",
        action: "set_negative_prompt",
        arg: Some("negative_prompt"),
    },
    CommandSpec {
        command: "theme",
        action: "set_theme",
        arg: Some("theme"),
    },
    CommandSpec {
        command: "seed",
        action: "set_seed",
        arg: Some("seed"),
    },
    CommandSpec {
        command: "cfg",
        action: "set_cfg_scale",
        arg: Some("cfg_scale"),
    },
    CommandSpec {
        command: "aspect",
        action: "set_aspect_ratio",
        arg: Some("aspect_ratio"),
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "random",
        action: "select_random_concept_and_style",
        arg: None,
    },
    CommandSpec {
        command: "generate",
        action: "generate_image_now",
        arg: None,
    },
    CommandSpec {
        command: "start",
        action: "start_evolution",
        arg: None,
    },
    CommandSpec {
        command: "stop",
        action: "stop_evolution",
        arg: None,
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg: None,
    },
];

/// Actions the chat bridge accepts as function calls.
pub(crate) const BRIDGE_FUNCTIONS: &[&str] = &[
    "set_art_style",
    "set_negative_prompt",
    "set_theme",
    "set_seed",
    "set_cfg_scale",
    "set_aspect_ratio",
    "select_random_concept_and_style",
    "generate_image_now",
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/style <art style>",
    "/negative <text>",
    "/theme <concept>",
    "/seed <integer|random>",
    "/cfg <0-30>",
    "/aspect <W:H>",
    "/random",
    "/generate",
    "/start",
    "/stop",
    "/help",
];

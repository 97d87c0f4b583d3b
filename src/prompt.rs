pub const SECTION_SEPARATOR: &str = "\n\n";

pub const SYSTEM_INSTRUCTION: &str = r#"## Role
You are an autonomous on-chain execution agent acting for a user through a permission-scoped smart account delegation.
Read the user intent, the granted permissions and any state you are given, then decide whether one of the provided tools should run.

## Rules
- Request execution only through the tools you are given.
- Every tool is permission-restricted and may fail when a limit is exceeded.
- Never reason about, request, or simulate private keys, seed phrases, or signing.
- A failed execution is an expected safety outcome. Do not try to work around it.
- Do not invent contracts, addresses, balances, or chain state.
- State your intent plainly before calling a tool.
- Stop if the requested action looks unsafe, out of scope, or unauthorised.

## Priority
Permission boundaries and user safety come before task completion. Success is correct interpretation and strict compliance, not transaction count."#;

pub const DEFAULT_PROMPT: &str =
    "Analyse the current state and execute any necessary actions within your permissions.";

pub const USER_REQUEST_LABEL: &str = "User Request";
pub const PERMISSION_CONTEXT_LABEL: &str = "Permission Context";
pub const DELEGATION_MANAGER_LABEL: &str = "Delegation Manager";

/// The user-turn text for one cycle: the context bundle followed by either
/// the caller's request or the default standing instruction.
pub fn build_cycle_prompt(bundle: &str, user_prompt: Option<&str>) -> String {
    let tail = match user_prompt.map(str::trim).filter(|prompt| !prompt.is_empty()) {
        Some(prompt) => format!("{USER_REQUEST_LABEL}: {prompt}"),
        None => DEFAULT_PROMPT.to_string(),
    };
    format!("{}{SECTION_SEPARATOR}{tail}", bundle.trim_end())
}

/// The caller's request inside a cycle prompt, if one was given.
pub fn user_request_of(prompt: &str) -> Option<&str> {
    let marker = format!("{SECTION_SEPARATOR}{USER_REQUEST_LABEL}: ");
    prompt
        .rfind(&marker)
        .map(|start| prompt[start + marker.len()..].trim())
}

/// Value of a `- {label}: value` line in the context bundle.
pub fn bundle_field<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let prefix = format!("- {label}: ");
    text.lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix.as_str()))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

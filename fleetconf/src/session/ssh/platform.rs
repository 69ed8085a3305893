//! Per-platform CLI conventions.
//!
//! Each entry describes how to recognise the device prompt, which output
//! means a command was refused, and how to read, enter and leave the
//! configuration. Prompt patterns use `(?mi)` so `^` and `$` anchor on lines.
//!
//! ```text
//! router>                      # cisco_ios exec
//! router(config-if)#           # cisco_ios configuration
//! RP/0/RP0/CPU0:xr1#           # cisco_xr
//! {master:0}[edit]             # juniper_junos routing-engine banner
//! admin@mx1#                   # juniper_junos configuration
//! ```

/// CLI conventions for one platform.
#[derive(Debug, PartialEq, Eq)]
pub struct Platform {
    /// Canonical platform tag.
    pub name: &'static str,

    /// Pattern matching any prompt of the platform.
    pub prompt: &'static str,

    /// Output fragments meaning the command was refused.
    pub failure_markers: &'static [&'static str],

    /// Commands sent once after the session opens (paging off).
    pub on_open: &'static [&'static str],

    /// Command printing the running configuration.
    pub show_config: &'static str,

    /// Command entering configuration mode.
    pub config_enter: &'static str,

    /// Commands committing and leaving configuration mode.
    pub config_exit: &'static [&'static str],

    /// Commands discarding a partially applied batch.
    pub config_abort: &'static [&'static str],
}

const CISCO_FAILURES: &[&str] = &[
    "% Ambiguous command",
    "% Incomplete command",
    "% Invalid input",
    "% Unknown command",
    "% Error",
];

const CISCO_IOS: Platform = Platform {
    name: "cisco_ios",
    prompt: r"(?mi)^[\w.\-@()/: ]{1,63}(\(config[\w.\-@/:+]{0,63}\))?[>#]\s?$",
    failure_markers: CISCO_FAILURES,
    on_open: &["terminal length 0", "terminal width 511"],
    show_config: "show running-config",
    config_enter: "configure terminal",
    config_exit: &["end"],
    config_abort: &["end"],
};

const CISCO_XE: Platform = Platform {
    name: "cisco_xe",
    ..CISCO_IOS
};

const CISCO_NXOS: Platform = Platform {
    name: "cisco_nxos",
    failure_markers: &[
        "% Ambiguous command",
        "% Incomplete command",
        "% Invalid command",
        "% Invalid number",
        "% Invalid parameter",
        "% Permission denied",
    ],
    on_open: &["terminal length 0", "terminal width 511"],
    ..CISCO_IOS
};

const CISCO_XR: Platform = Platform {
    name: "cisco_xr",
    prompt: r"(?mi)^(RP/\d+/\w+/CPU\d+:)?[\w.\-@/:]{1,63}(\(config[\w.\-@/:]{0,32}\))?[>#]\s?$",
    failure_markers: &[
        "% Ambiguous command",
        "% Incomplete command",
        "% Invalid input detected",
        "% Failed to commit",
    ],
    on_open: &["terminal length 0", "terminal width 512"],
    show_config: "show running-config",
    config_enter: "configure terminal",
    config_exit: &["commit", "end"],
    config_abort: &["abort"],
};

const ARISTA_EOS: Platform = Platform {
    name: "arista_eos",
    failure_markers: &[
        "% Ambiguous command",
        "% Error",
        "% Incomplete command",
        "% Invalid input",
        "% Cannot commit",
        "% Unavailable command",
        "% Duplicate sequence number",
    ],
    on_open: &["terminal length 0", "terminal width 32767"],
    ..CISCO_IOS
};

const JUNIPER_JUNOS: Platform = Platform {
    name: "juniper_junos",
    prompt: r"(?mi)^[\w\-@()/:\.]{1,63}[>#]\s?$",
    failure_markers: &[
        "is ambiguous",
        "No valid completions",
        "unknown command",
        "syntax error",
        "missing argument",
        "error:",
    ],
    on_open: &["set cli screen-length 0", "set cli screen-width 511"],
    show_config: "show configuration | display set",
    config_enter: "configure",
    config_exit: &["commit and-quit"],
    config_abort: &["rollback 0", "exit configuration-mode"],
};

static PLATFORMS: &[Platform] = &[
    CISCO_IOS,
    CISCO_XE,
    CISCO_NXOS,
    CISCO_XR,
    ARISTA_EOS,
    JUNIPER_JUNOS,
];

/// Look up a platform by tag.
///
/// Tags are case-insensitive. Short vendor-less tags are accepted: `eos`
/// and `junos` name their vendor's platform, anything else is tried as a
/// Cisco variant (`ios` is `cisco_ios`).
pub fn lookup(tag: &str) -> Option<&'static Platform> {
    let tag = tag.trim().to_ascii_lowercase();
    let canonical = match tag.as_str() {
        "eos" | "arista" => "arista_eos".to_string(),
        "junos" | "juniper" => "juniper_junos".to_string(),
        "xr" | "iosxr" => "cisco_xr".to_string(),
        "xe" | "iosxe" => "cisco_xe".to_string(),
        t if t.contains('_') => t.to_string(),
        t => format!("cisco_{t}"),
    };
    PLATFORMS.iter().find(|p| p.name == canonical)
}

/// Names of all supported platforms.
pub fn names() -> impl Iterator<Item = &'static str> {
    PLATFORMS.iter().map(|p| p.name)
}

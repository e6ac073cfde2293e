//! Tool implementations and the registry that holds them.

pub mod ask_user;
pub mod base;
pub mod documents;
pub mod filesystem;
pub mod ocr;
pub mod registry;
pub mod shell;
pub mod skill;
pub mod skill_create;
pub mod web;

pub use ask_user::{AskFn, AskUserTool};
pub use base::{
    optional_i64, optional_string, optional_string_list, require_string, RiskTier, Tool,
};
pub use filesystem::{FileListTool, FileReadTool, FileWriteTool};
pub use ocr::OcrTool;
pub use registry::{DuplicateTool, ToolRegistry};
pub use shell::ShellTool;
pub use skill::SkillTool;
pub use skill_create::SkillCreateTool;
pub use web::WebFetchTool;

/// Names skills may declare besides other skills.
pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "file_read",
    "file_list",
    "file_write",
    "shell",
    "web_fetch",
    "ocr",
    "ask_user",
    "skill_create",
];

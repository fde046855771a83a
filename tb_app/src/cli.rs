/// Default config file read by the gate
pub const DEFAULT_CONFIG_PATH: &str = "config/tb_gate.toml";

/// Parses the config file path from command-line arguments
pub fn config_path(default: &str) -> String {
    config_path_from(std::env::args(), default)
}

fn config_path_from<I: IntoIterator<Item = String>>(args: I, default: &str) -> String {
    args.into_iter().nth(1).unwrap_or_else(|| default.to_string())
}

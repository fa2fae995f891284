use std::{fs, path::Path};

use anyhow::Context;

use crate::config_store::{PerformanceSettings, ServerConfig};
use crate::process_manager_support::CommandLine;

/// Written by the managed process itself; only the `stop` keyword is reserved.
pub const SHUTDOWN_COMMAND: &str = "stop";

pub const JAVA_PORT: u16 = 25565;
pub const BEDROCK_PORT: u16 = 19132;

const DEFAULT_MIN_HEAP: &str = "1G";
const DEFAULT_MAX_HEAP: &str = "2G";

/// `512M`, `2G`, `1048576`...
fn is_valid_heap(v: &str) -> bool {
    let digits = v.trim_end_matches(['K', 'k', 'M', 'm', 'G', 'g']);
    let suffix_len = v.len() - digits.len();
    suffix_len <= 1 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Heap bounds to pass to the JVM, falling back to defaults for invalid values.
pub fn heap_bounds(perf: &PerformanceSettings) -> (String, String, Vec<String>) {
    let mut warnings = Vec::new();
    let mut pick = |label: &str, raw: &str, fallback: &str| {
        let v = raw.trim();
        if is_valid_heap(v) {
            v.to_string()
        } else {
            warnings.push(format!(
                "invalid {label} heap size {raw:?}; using {fallback}"
            ));
            fallback.to_string()
        }
    };
    let min = pick("minimum", &perf.min_ram, DEFAULT_MIN_HEAP);
    let max = pick("maximum", &perf.max_ram, DEFAULT_MAX_HEAP);
    (min, max, warnings)
}

/// Full argument list after the launcher program.
pub fn launch_args(
    java: &CommandLine,
    server_jar: &str,
    config: &ServerConfig,
) -> (Vec<String>, Vec<String>) {
    let (min, max, warnings) = heap_bounds(&config.performance);
    let mut args = java.args.clone();
    args.extend([
        format!("-Xms{min}"),
        format!("-Xmx{max}"),
        "-jar".to_string(),
        server_jar.to_string(),
        "nogui".to_string(),
    ]);
    (args, warnings)
}

fn escape_property(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_server_properties(config: &ServerConfig) -> String {
    let s = &config.server;
    let lines: [(&str, String); 17] = [
        ("server-port", JAVA_PORT.to_string()),
        ("level-seed", s.seed.clone()),
        ("gamemode", s.gamemode.clone()),
        ("difficulty", s.difficulty.clone()),
        ("max-players", s.max_players.to_string()),
        ("motd", s.motd.clone()),
        ("pvp", s.pvp.to_string()),
        ("enable-command-block", s.enable_command_block.to_string()),
        ("allow-nether", s.allow_nether.to_string()),
        ("allow-end", s.allow_end.to_string()),
        ("spawn-protection", s.spawn_protection.to_string()),
        ("view-distance", s.view_distance.to_string()),
        ("simulation-distance", s.simulation_distance.to_string()),
        ("level-name", s.level_name.clone()),
        ("online-mode", s.online_mode.to_string()),
        ("white-list", s.white_list.to_string()),
        ("require-resource-pack", s.require_resource_pack.to_string()),
    ];

    let mut out = String::from("#Minecraft server properties\n#Generated by hearth-agent\n");
    for (key, value) in lines {
        out.push_str(key);
        out.push('=');
        out.push_str(&escape_property(&value));
        out.push('\n');
    }
    out
}

/// Writes `server.properties` and `eula.txt` ahead of a spawn.
pub fn write_server_files(server_dir: &Path, config: &ServerConfig) -> anyhow::Result<()> {
    fs::create_dir_all(server_dir)
        .with_context(|| format!("create server dir {}", server_dir.display()))?;
    fs::write(
        server_dir.join("server.properties"),
        render_server_properties(config),
    )
    .context("write server.properties")?;
    fs::write(server_dir.join("eula.txt"), b"eula=true\n").context("write eula.txt")?;
    Ok(())
}

use std::{env, path::PathBuf};

use anyhow::{Result, anyhow, bail};

const DEFAULT_CONFIG_FILE: &str = "gateway.jsonc";
const USAGE: &str = "usage: coherence-gateway [--config <path>] \
[serve | keys create --owner <label> --tier <tier> | keys revoke --id <id> | keys list]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    CreateKey { owner: String, tier: String },
    RevokeKey { id: String },
    ListKeys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub command: Command,
}

pub fn args_from_env() -> Result<CliArgs> {
    let default_config = env::current_dir()?.join(DEFAULT_CONFIG_FILE);
    parse_args(env::args().skip(1), default_config)
}

pub fn parse_args<I>(args: I, default_config: PathBuf) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args
                .next()
                .ok_or_else(|| anyhow!("--config expects a path. {USAGE}"))?;
            config_path = Some(PathBuf::from(path));
        } else {
            words.push(arg);
        }
    }

    let command = match words.first().map(String::as_str) {
        None | Some("serve") if words.len() <= 1 => Command::Serve,
        Some("keys") => parse_keys(&words[1..])?,
        _ => bail!("unrecognized arguments {words:?}. {USAGE}"),
    };

    Ok(CliArgs {
        config_path: config_path.unwrap_or(default_config),
        command,
    })
}

fn parse_keys(words: &[String]) -> Result<Command> {
    let Some((action, flags)) = words.split_first() else {
        bail!("keys expects an action. {USAGE}");
    };
    let flag = |name: &str| -> Result<String> {
        let position = flags
            .iter()
            .position(|word| word == name)
            .ok_or_else(|| anyhow!("keys {action} requires {name}. {USAGE}"))?;
        flags
            .get(position + 1)
            .filter(|value| !value.starts_with("--"))
            .cloned()
            .ok_or_else(|| anyhow!("{name} expects a value. {USAGE}"))
    };

    match action.as_str() {
        "create" => Ok(Command::CreateKey {
            owner: flag("--owner")?,
            tier: flag("--tier")?,
        }),
        "revoke" => Ok(Command::RevokeKey { id: flag("--id")? }),
        "list" if flags.is_empty() => Ok(Command::ListKeys),
        _ => bail!("unrecognized keys command {words:?}. {USAGE}"),
    }
}

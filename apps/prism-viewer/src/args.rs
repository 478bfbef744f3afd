//! Command-line arguments.

use std::path::PathBuf;

use anyhow::{bail, Context};
use prism_app::{AppConfig, DEFAULT_SHADER_DIR};

/// Environment variable overriding the default shader directory.
pub const SHADER_DIR_ENV: &str = "PRISM_SHADER_DIR";

/// Parsed viewer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerArgs {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub shader_dir: Option<PathBuf>,
    pub validation: Option<bool>,
    pub no_overlay: bool,
    pub help: bool,
}

impl ViewerArgs {
    /// Parse arguments, excluding the program name.
    pub fn parse<I>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self {
            width: None,
            height: None,
            shader_dir: None,
            validation: None,
            no_overlay: false,
            help: false,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--width" => parsed.width = Some(parse_dimension(&arg, args.next())?),
                "--height" => parsed.height = Some(parse_dimension(&arg, args.next())?),
                "--shader-dir" => {
                    let dir = args.next().with_context(|| format!("{arg} needs a value"))?;
                    parsed.shader_dir = Some(PathBuf::from(dir));
                }
                "--validation" => parsed.validation = Some(true),
                "--no-validation" => parsed.validation = Some(false),
                "--no-overlay" => parsed.no_overlay = true,
                "-h" | "--help" => parsed.help = true,
                other => bail!("unknown argument '{other}' (see --help)"),
            }
        }

        Ok(parsed)
    }

    /// Build the app config. `env_shader_dir` is used when `--shader-dir` is absent.
    pub fn into_config(self, env_shader_dir: Option<PathBuf>) -> AppConfig {
        let defaults = AppConfig::new("Prism - Ray Traced Triangle");
        let width = self.width.unwrap_or(defaults.width);
        let height = self.height.unwrap_or(defaults.height);
        let validation = self.validation.unwrap_or(defaults.validation);
        let shader_dir = self
            .shader_dir
            .or(env_shader_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHADER_DIR));

        defaults
            .with_size(width, height)
            .with_validation(validation)
            .with_shader_dir(shader_dir)
            .with_overlay(!self.no_overlay)
    }
}

fn parse_dimension(flag: &str, value: Option<String>) -> anyhow::Result<u32> {
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    let parsed: u32 = value
        .parse()
        .with_context(|| format!("invalid value '{value}' for {flag}"))?;
    if parsed == 0 {
        bail!("{flag} must be greater than zero");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ViewerArgs> {
        ViewerArgs::parse(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn empty_args_use_defaults() {
        let config = parse(&[]).unwrap().into_config(None);
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(config.shader_dir, PathBuf::from("shaders/spv"));
        assert!(config.overlay);
    }

    #[test]
    fn parses_every_option() {
        let args = parse(&[
            "--width",
            "1024",
            "--height",
            "768",
            "--shader-dir",
            "build/spv",
            "--no-validation",
            "--no-overlay",
        ])
        .unwrap();

        assert_eq!(args.width, Some(1024));
        assert_eq!(args.height, Some(768));
        assert_eq!(args.validation, Some(false));
        assert!(args.no_overlay);
        assert!(!args.help);

        let config = args.into_config(None);
        assert_eq!((config.width, config.height), (1024, 768));
        assert!(!config.validation);
        assert!(!config.overlay);
        assert_eq!(config.shader_dir, PathBuf::from("build/spv"));
    }

    #[test]
    fn later_validation_flag_wins() {
        let args = parse(&["--no-validation", "--validation"]).unwrap();
        assert_eq!(args.validation, Some(true));
    }

    #[test]
    fn shader_dir_precedence() {
        let env = Some(PathBuf::from("/env/spv"));

        let config = parse(&[]).unwrap().into_config(env.clone());
        assert_eq!(config.shader_dir, PathBuf::from("/env/spv"));

        let config = parse(&["--shader-dir", "/cli/spv"]).unwrap().into_config(env);
        assert_eq!(config.shader_dir, PathBuf::from("/cli/spv"));
    }

    #[test]
    fn help_flag() {
        assert!(parse(&["-h"]).unwrap().help);
        assert!(parse(&["--help"]).unwrap().help);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["--width"]).is_err());
        assert!(parse(&["--width", "wide"]).is_err());
        assert!(parse(&["--height", "0"]).is_err());
        assert!(parse(&["--shader-dir"]).is_err());
        assert!(parse(&["--fullscreen"]).is_err());
    }
}

//! Command line parsing.

use std::path::PathBuf;

use chrono::NaiveDate;

/// Options for one run of the binary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliConfig {
    /// Narrative file; stdin when absent.
    pub input: Option<PathBuf>,
    /// JSON file with pre-extracted events.
    pub candidates: Option<PathBuf>,
    pub birth_date: Option<NaiveDate>,
    pub reference_date: Option<NaiveDate>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    /// Use the local heuristics even when an API key is set.
    pub offline: bool,
    pub merge_branches: bool,
    pub help: bool,
}

/// Parse `args` (including the program name).
pub fn parse_config_from_args(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => config.help = true,
            "--offline" => config.offline = true,
            "--merge-branches" => config.merge_branches = true,
            "--no-cache" => config.no_cache = true,
            "--input" => config.input = Some(value(args, &mut i)?.into()),
            "--candidates" => config.candidates = Some(value(args, &mut i)?.into()),
            "--cache-dir" => config.cache_dir = Some(value(args, &mut i)?.into()),
            "--birth-date" => config.birth_date = Some(date(value(args, &mut i)?)?),
            "--reference-date" => config.reference_date = Some(date(value(args, &mut i)?)?),
            other => return Err(format!("unknown argument '{other}'")),
        }
        i += 1;
    }

    Ok(config)
}

fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} needs a value"))
}

fn date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("lifeline")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = parse_config_from_args(&args(&[])).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_all_options() {
        let config = parse_config_from_args(&args(&[
            "--input",
            "story.txt",
            "--birth-date",
            "1990-04-02",
            "--reference-date",
            "2025-01-01",
            "--offline",
            "--merge-branches",
            "--cache-dir",
            "/tmp/lifeline",
        ]))
        .unwrap();

        assert_eq!(config.input, Some(PathBuf::from("story.txt")));
        assert_eq!(config.birth_date, NaiveDate::from_ymd_opt(1990, 4, 2));
        assert_eq!(config.reference_date, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert!(config.offline);
        assert!(config.merge_branches);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/lifeline")));
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let err = parse_config_from_args(&args(&["--input"])).unwrap_err();
        assert!(err.contains("--input"));
    }

    #[test]
    fn test_bad_date_is_an_error() {
        assert!(parse_config_from_args(&args(&["--birth-date", "April 1990"])).is_err());
    }

    #[test]
    fn test_unknown_flag_is_an_error() {
        assert!(parse_config_from_args(&args(&["--verbose"])).is_err());
    }
}

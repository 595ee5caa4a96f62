//! Semantic containers for the configurable options. Each type keeps its
//! permissive parser next to the variant definition, so the CLI, environment
//! variables, and YAML files all go through the same validation.

use crate::conf::ConfigError;

/// Split a string on commas, semicolons, and/or whitespace and parse every
/// part as a float. Returns None if any part fails to parse.
fn parse_float_list(raw: &str) -> Option<Vec<f64>> {
    let parts: Vec<&str> = raw
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    parts.iter().map(|p| p.parse::<f64>().ok()).collect()
}

/// White balance multipliers applied when developing a photo.
///
/// A 3-tuple input (r, g, b) is broadened to (r, g, b, g).
#[derive(Debug, Clone, PartialEq)]
pub enum WhiteBalance {
    Auto,
    Camera,
    Default,
    Manual([f64; 4]),
}

impl WhiteBalance {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let s = raw.trim().to_lowercase();
        match s.as_str() {
            "auto" => return Ok(WhiteBalance::Auto),
            "camera" => return Ok(WhiteBalance::Camera),
            "default" => return Ok(WhiteBalance::Default),
            _ => {}
        }
        match parse_float_list(&s) {
            Some(v) => Self::from_multipliers(&v),
            None => Err(ConfigError::value(
                "white_balance",
                format!("expected auto/camera/default or 3-4 multipliers, got \"{raw}\""),
            )),
        }
    }

    pub fn from_multipliers(v: &[f64]) -> Result<Self, ConfigError> {
        if v.iter().any(|m| *m < 0.0 || !m.is_finite()) {
            return Err(ConfigError::value(
                "white_balance",
                "multipliers must be non-negative",
            ));
        }
        match v {
            [r, g, b] => Ok(WhiteBalance::Manual([*r, *g, *b, *g])),
            [r, g1, b, g2] => Ok(WhiteBalance::Manual([*r, *g1, *b, *g2])),
            _ => Err(ConfigError::value(
                "white_balance",
                format!("expected 3 or 4 multipliers, got {}", v.len()),
            )),
        }
    }
}

/// Red and blue chromatic aberration correction multipliers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChromaticAberration {
    pub red: f64,
    pub blue: f64,
}

impl ChromaticAberration {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match parse_float_list(raw) {
            Some(v) => Self::from_multipliers(&v),
            None => Err(ConfigError::value(
                "chromatic_aberration",
                format!("expected 2 multipliers, got \"{raw}\""),
            )),
        }
    }

    pub fn from_multipliers(v: &[f64]) -> Result<Self, ConfigError> {
        if v.len() != 2 {
            return Err(ConfigError::value(
                "chromatic_aberration",
                format!("expected exactly 2 multipliers, got {}", v.len()),
            ));
        }
        if v.iter().any(|m| *m < 0.0 || !m.is_finite()) {
            return Err(ConfigError::value(
                "chromatic_aberration",
                "multipliers must be non-negative",
            ));
        }
        Ok(ChromaticAberration { red: v[0], blue: v[1] })
    }
}

impl Default for ChromaticAberration {
    fn default() -> Self {
        ChromaticAberration { red: 1.0, blue: 1.0 }
    }
}

/// How group directory names are interpreted and ordered within a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupOrdering {
    /// Only all-alphabetic names, ordered a, b, ..., z, aa, ab, ...
    #[default]
    Abc,
    /// All names, lexicographic order.
    Natural,
    /// Only names that parse as a decimal number, numeric order.
    Num,
}

impl GroupOrdering {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "abc" => Ok(GroupOrdering::Abc),
            "natural" => Ok(GroupOrdering::Natural),
            "num" => Ok(GroupOrdering::Num),
            other => Err(ConfigError::value(
                "group_ordering",
                format!("expected abc, natural, or num, got \"{other}\""),
            )),
        }
    }
}

/// Where thumbnails are written, relative to the project layout.
///
/// For the raw picture `2000-01-01/a/0001.dng` with path `thumb`:
/// - Root:   `<project>/thumb/2000-01-01/a/0001.jpg`
/// - Date:   `<project>/2000-01-01/thumb/a/0001.jpg`
/// - Group:  `<project>/2000-01-01/a/thumb/0001.jpg`
/// - Custom: `<custom path>/2000-01-01/a/0001.jpg`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThumbLocation {
    #[default]
    Root,
    Date,
    Group,
    Custom,
}

impl ThumbLocation {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "root" | "project" => Ok(ThumbLocation::Root),
            "date" => Ok(ThumbLocation::Date),
            "group" => Ok(ThumbLocation::Group),
            "custom" | "other" => Ok(ThumbLocation::Custom),
            other => Err(ConfigError::value(
                "thumbnail_location",
                format!("expected root, date, group, or custom, got \"{other}\""),
            )),
        }
    }
}

/// Flip and rotation applied when developing a photo. Matches the dcraw
/// user-flip numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipRotate {
    /// Use the orientation baked into the raw file, if any.
    #[default]
    Default,
    /// Ignore any baked-in orientation.
    None,
    HorizontalFlip,
    VerticalFlip,
    HalfRotation,
    RotateCwHorizontalFlip,
    RotateCcw,
    RotateCw,
    RotateCcwHorizontalFlip,
}

impl FlipRotate {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let s = raw.trim().to_lowercase();
        // Degree aliases map onto the matching rotation variant
        match s.as_str() {
            "90" => return Ok(FlipRotate::RotateCw),
            "180" => return Ok(FlipRotate::HalfRotation),
            "270" => return Ok(FlipRotate::RotateCcw),
            _ => {}
        }
        match s.as_str() {
            "" | "default" => Ok(FlipRotate::Default),
            "none" => Ok(FlipRotate::None),
            "horizontal_flip" => Ok(FlipRotate::HorizontalFlip),
            "vertical_flip" => Ok(FlipRotate::VerticalFlip),
            "half_rotation" => Ok(FlipRotate::HalfRotation),
            "rotate_cw_horizontal_flip" => Ok(FlipRotate::RotateCwHorizontalFlip),
            "rotate_ccw" => Ok(FlipRotate::RotateCcw),
            "rotate_cw" => Ok(FlipRotate::RotateCw),
            "rotate_ccw_horizontal_flip" => Ok(FlipRotate::RotateCcwHorizontalFlip),
            other => Err(ConfigError::value(
                "flip_rotate",
                format!("unknown flip/rotate value \"{other}\""),
            )),
        }
    }
}

/// Restricts a run to the first N photos (`"N"`) or to N pseudo-random
/// photos (`"~N"`). `"-1"` disables sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sample {
    #[default]
    Off,
    Deterministic(usize),
    Random(usize),
}

impl Sample {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(Sample::Off);
        }
        let (random, num) = match s.strip_prefix('~') {
            Some(rest) => (true, rest.trim()),
            None => (false, s),
        };
        let n: i64 = num.parse().map_err(|_| {
            ConfigError::value(
                "sample",
                format!("expected an integer sample size, got \"{raw}\""),
            )
        })?;
        if n == -1 && !random {
            return Ok(Sample::Off);
        }
        if n < 1 {
            // "~-1" in particular is rejected: a randomized sample needs a size
            return Err(ConfigError::value(
                "sample",
                format!("sample size must be a positive integer (or -1 to disable), got \"{raw}\""),
            ));
        }
        if random {
            Ok(Sample::Random(n as usize))
        } else {
            Ok(Sample::Deterministic(n as usize))
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Sample::Off)
    }

    pub fn is_random(self) -> bool {
        matches!(self, Sample::Random(_))
    }

    /// The sample size, or None when sampling is disabled.
    pub fn size(self) -> Option<usize> {
        match self {
            Sample::Off => None,
            Sample::Deterministic(n) | Sample::Random(n) => Some(n),
        }
    }
}

/// Console log verbosity. At most one of verbose/quiet/silent may be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Verbose,
    #[default]
    Default,
    Quiet,
    Silent,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "verbose" => Ok(LogLevel::Verbose),
            "" | "default" => Ok(LogLevel::Default),
            "quiet" => Ok(LogLevel::Quiet),
            "silent" => Ok(LogLevel::Silent),
            other => Err(ConfigError::value(
                "log_level",
                format!("expected verbose, default, quiet, or silent, got \"{other}\""),
            )),
        }
    }
}

/// Transform a human date format like `yyyy-mm-dd` into the strftime form
/// `%Y-%m-%d`.
///
/// Replacements (case-insensitive): `yyyy` -> `%Y`, `yy` -> `%y`,
/// `mm`/`m` -> `%m`, `dd`/`d` -> `%d`. A backslash escapes the following
/// character; recognized `%`-forms pass through unchanged.
pub fn process_date_format(format_str: &str) -> String {
    let chars: Vec<char> = format_str.chars().collect();
    let mut result = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' {
            if i + 1 == chars.len() {
                result.push('\\');
                return result;
            }
            result.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if chars[i] == '%' {
            if i + 1 == chars.len() {
                result.push('%');
                return result;
            }
            let next = chars[i + 1].to_ascii_lowercase();
            if matches!(next, 'y' | 'm' | 'd' | '%') {
                result.push('%');
                result.push(chars[i + 1]);
                i += 2;
                continue;
            }
        }
        let lower = chars[i].to_ascii_lowercase();
        let next_lower = chars.get(i + 1).map(|c| c.to_ascii_lowercase());
        match lower {
            'y' if next_lower == Some('y') => {
                let four = chars.len() >= i + 4
                    && chars[i + 2].to_ascii_lowercase() == 'y'
                    && chars[i + 3].to_ascii_lowercase() == 'y';
                if four {
                    result.push_str("%Y");
                    i += 4;
                } else {
                    result.push_str("%y");
                    i += 2;
                }
            }
            'm' => {
                result.push_str("%m");
                i += if next_lower == Some('m') { 2 } else { 1 };
            }
            'd' => {
                result.push_str("%d");
                i += if next_lower == Some('d') { 2 } else { 1 };
            }
            _ => {
                result.push(chars[i]);
                i += 1;
            }
        }
    }
    result
}

/// Check whether a directory name parses under the configured date format.
pub fn matches_date_format(name: &str, format: &str) -> bool {
    chrono::NaiveDate::parse_from_str(name, format).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_white_balance_keywords() {
        assert_eq!(WhiteBalance::parse("auto").unwrap(), WhiteBalance::Auto);
        assert_eq!(WhiteBalance::parse(" Camera ").unwrap(), WhiteBalance::Camera);
        assert_eq!(WhiteBalance::parse("DEFAULT").unwrap(), WhiteBalance::Default);
    }

    #[test]
    fn test_white_balance_three_tuple_broadens_green() {
        let wb = WhiteBalance::parse("2.0, 1.0, 1.5").unwrap();
        assert_eq!(wb, WhiteBalance::Manual([2.0, 1.0, 1.5, 1.0]));
    }

    #[test]
    fn test_white_balance_four_tuple() {
        let wb = WhiteBalance::parse("2 1 1.5 1.1").unwrap();
        assert_eq!(wb, WhiteBalance::Manual([2.0, 1.0, 1.5, 1.1]));
    }

    #[test]
    fn test_white_balance_rejects_negative() {
        assert!(WhiteBalance::parse("-1 1 1").is_err());
    }

    #[test]
    fn test_white_balance_rejects_garbage() {
        assert!(WhiteBalance::parse("warm").is_err());
        assert!(WhiteBalance::parse("1 2").is_err());
    }

    #[test]
    fn test_chromatic_aberration() {
        let ca = ChromaticAberration::parse("1.0; 1.2").unwrap();
        assert_eq!(ca, ChromaticAberration { red: 1.0, blue: 1.2 });
        assert!(ChromaticAberration::parse("1").is_err());
        assert!(ChromaticAberration::parse("1 2 3").is_err());
        assert!(ChromaticAberration::parse("-0.5 1").is_err());
    }

    #[test]
    fn test_group_ordering_case_insensitive() {
        assert_eq!(GroupOrdering::parse(" ABC ").unwrap(), GroupOrdering::Abc);
        assert_eq!(GroupOrdering::parse("natural").unwrap(), GroupOrdering::Natural);
        assert_eq!(GroupOrdering::parse("Num").unwrap(), GroupOrdering::Num);
        assert!(GroupOrdering::parse("alphabetical").is_err());
    }

    #[test]
    fn test_thumb_location_aliases() {
        assert_eq!(ThumbLocation::parse("project").unwrap(), ThumbLocation::Root);
        assert_eq!(ThumbLocation::parse("other").unwrap(), ThumbLocation::Custom);
        assert_eq!(ThumbLocation::parse("Date").unwrap(), ThumbLocation::Date);
        assert!(ThumbLocation::parse("sideways").is_err());
    }

    #[test]
    fn test_flip_rotate_degree_aliases() {
        assert_eq!(FlipRotate::parse("90").unwrap(), FlipRotate::RotateCw);
        assert_eq!(FlipRotate::parse("180").unwrap(), FlipRotate::HalfRotation);
        assert_eq!(FlipRotate::parse("270").unwrap(), FlipRotate::RotateCcw);
        assert_eq!(FlipRotate::parse("none").unwrap(), FlipRotate::None);
        assert!(FlipRotate::parse("45").is_err());
    }

    #[test]
    fn test_sample_parsing() {
        assert_eq!(Sample::parse("5").unwrap(), Sample::Deterministic(5));
        assert_eq!(Sample::parse("~3").unwrap(), Sample::Random(3));
        assert_eq!(Sample::parse("-1").unwrap(), Sample::Off);
        assert!(Sample::parse("0").is_err());
        assert!(Sample::parse("2.5").is_err());
        assert!(Sample::parse("-2").is_err());
    }

    #[test]
    fn test_sample_rejects_tilde_negative_one() {
        // "-1" disables sampling, but a randomized sample needs a real size
        assert!(Sample::parse("~-1").is_err());
        assert!(Sample::parse("~0").is_err());
    }

    #[test]
    fn test_date_format_human_to_strftime() {
        assert_eq!(process_date_format("yyyy-mm-dd"), "%Y-%m-%d");
        assert_eq!(process_date_format("yy/m/d"), "%y/%m/%d");
        assert_eq!(process_date_format("%Y-%m-%d"), "%Y-%m-%d");
    }

    #[test]
    fn test_date_format_backslash_escapes() {
        assert_eq!(process_date_format("\\d"), "d");
        assert_eq!(process_date_format("\\y\\y\\y\\y"), "yyyy");
        assert_eq!(process_date_format("yyyy\\-mm"), "%Y-%m");
    }

    #[test]
    fn test_date_format_accepts_and_rejects() {
        let fmt = process_date_format("yyyy-mm-dd");
        assert!(matches_date_format("2025-01-01", &fmt));
        assert!(!matches_date_format("2025/01/01", &fmt));
        assert!(!matches_date_format("notadate", &fmt));
    }
}

use std::path::PathBuf;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};

/// Templates offered for the filename date segment. Any strftime template
/// is accepted; these are the curated choices.
pub const DATE_FORMAT_OPTIONS: &[&str] = &[
    "%Y%m%d%H%M",
    "%Y%m%d%H%M%S",
    "%Y%m%d",
    "%Y-%m-%d-%H_%M_%S",
    "%Y-%m-%d-%H_%M",
    "%Y-%m-%d",
    "%Y-%m-%d %H_%M_%S",
    "%Y-%m-%d %H_%M",
    "%H%M",
    "%H%M%S",
    "%H_%M",
    "%H_%M_%S",
];

/// Sentinel emitted when the date template itself cannot be formatted.
pub const DATE_ERROR_SENTINEL: &str = "DATE_ERROR";

#[derive(Debug, Clone)]
pub struct FilenameSpec {
    pub model_name: String,
    pub output_folder: String,
    /// May itself contain strftime codes; an invalid template falls back
    /// to the literal text.
    pub subfolder: String,
    pub name_prefix: String,
    pub wf_version: String,
    pub upscaled_suffix: String,
    pub delimiter: String,
    pub date_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFilenames {
    pub filename: String,
    pub filename_upscaled: String,
}

pub fn generate_filenames(spec: &FilenameSpec) -> GeneratedFilenames {
    generate_filenames_at(spec, Local::now())
}

/// Pure variant taking the timestamp, so callers and tests can pin it.
pub fn generate_filenames_at(spec: &FilenameSpec, now: DateTime<Local>) -> GeneratedFilenames {
    let date_string =
        format_template(now, &spec.date_format).unwrap_or_else(|| DATE_ERROR_SENTINEL.to_string());
    let subfolder =
        format_template(now, &spec.subfolder).unwrap_or_else(|| spec.subfolder.clone());

    let base_name = join_non_empty(
        &[
            spec.name_prefix.as_str(),
            spec.wf_version.as_str(),
            spec.model_name.as_str(),
            date_string.as_str(),
        ],
        &spec.delimiter,
    );
    let upscaled_name = join_non_empty(
        &[base_name.as_str(), spec.upscaled_suffix.as_str()],
        &spec.delimiter,
    );

    GeneratedFilenames {
        filename: join_path(&spec.output_folder, &subfolder, &base_name),
        filename_upscaled: join_path(&spec.output_folder, &subfolder, &upscaled_name),
    }
}

/// Formats a strftime template, or returns None when the template has an
/// invalid specifier. chrono reports bad specifiers as parse items, which
/// lets the caller fall back instead of panicking mid-format.
fn format_template(now: DateTime<Local>, template: &str) -> Option<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    Some(now.format_with_items(items.into_iter()).to_string())
}

fn join_non_empty(parts: &[&str], delimiter: &str) -> String {
    parts
        .iter()
        .copied()
        .filter(|part| !part.is_empty())
        .collect::<Vec<&str>>()
        .join(delimiter)
}

/// Joins folder, subfolder, and filename, trimming stray separators and
/// skipping empty components.
fn join_path(folder: &str, subfolder: &str, name: &str) -> String {
    let mut path = PathBuf::new();
    for component in [folder, subfolder, name] {
        let cleaned = component
            .trim()
            .trim_matches(|c| c == '/' || c == '\\');
        if !cleaned.is_empty() {
            path.push(cleaned);
        }
    }
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn spec() -> FilenameSpec {
        FilenameSpec {
            model_name: "Foo".to_string(),
            output_folder: String::new(),
            subfolder: String::new(),
            name_prefix: "TA".to_string(),
            wf_version: "v1".to_string(),
            upscaled_suffix: "UPSCALED".to_string(),
            delimiter: "-".to_string(),
            date_format: "%Y%m%d".to_string(),
        }
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 1, 13, 30, 5).unwrap()
    }

    #[test]
    fn joins_prefix_version_model_and_date() {
        let names = generate_filenames_at(&spec(), fixed_now());
        assert_eq!(names.filename, "TA-v1-Foo-20240101");
        assert_eq!(names.filename_upscaled, "TA-v1-Foo-20240101-UPSCALED");
    }

    #[test]
    fn empty_segments_are_skipped() {
        let mut spec = spec();
        spec.wf_version = String::new();
        spec.upscaled_suffix = String::new();
        let names = generate_filenames_at(&spec, fixed_now());
        assert_eq!(names.filename, "TA-Foo-20240101");
        assert_eq!(names.filename_upscaled, "TA-Foo-20240101");
    }

    #[test]
    fn folder_and_subfolder_are_prepended() {
        let mut spec = spec();
        spec.output_folder = "outputs/".to_string();
        spec.subfolder = "renders".to_string();
        let names = generate_filenames_at(&spec, fixed_now());
        let expected: String = ["outputs", "renders", "TA-v1-Foo-20240101"]
            .into_iter()
            .collect::<PathBuf>()
            .to_string_lossy()
            .into_owned();
        assert_eq!(names.filename, expected);
    }

    #[test]
    fn subfolder_accepts_date_codes() {
        let mut spec = spec();
        spec.output_folder = "outputs".to_string();
        spec.subfolder = "%Y-%m".to_string();
        let names = generate_filenames_at(&spec, fixed_now());
        assert!(names.filename.contains("2024-01"));
        assert!(!names.filename.contains('%'));
    }

    #[test]
    fn invalid_subfolder_template_falls_back_to_literal() {
        let mut spec = spec();
        spec.output_folder = "outputs".to_string();
        spec.subfolder = "batch %q".to_string();
        let names = generate_filenames_at(&spec, fixed_now());
        assert!(names.filename.contains("batch %q"));
    }

    #[test]
    fn invalid_date_format_yields_sentinel() {
        let mut spec = spec();
        spec.date_format = "%q".to_string();
        let names = generate_filenames_at(&spec, fixed_now());
        assert_eq!(names.filename, "TA-v1-Foo-DATE_ERROR");
    }

    #[test]
    fn time_codes_format_from_the_clock() {
        let mut spec = spec();
        spec.date_format = "%H_%M".to_string();
        let names = generate_filenames_at(&spec, fixed_now());
        assert_eq!(names.filename, "TA-v1-Foo-13_30");
    }

    #[test]
    fn curated_templates_all_format() {
        let now = fixed_now();
        for template in DATE_FORMAT_OPTIONS {
            assert!(
                format_template(now, template).is_some(),
                "template {template} failed"
            );
        }
    }
}

use rand::Rng;
use rand::distributions::Alphanumeric;
use time::OffsetDateTime;

/// Parent of a POSIX-style relative path; `None` at the tree root.
pub fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rfind('/')
        .filter(|idx| *idx > 0)
        .map(|idx| trimmed[..idx].to_string())
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A fresh temp name adjacent to the destination, so the final rename stays
/// on one filesystem: `dir/.<name>.<suffix>.part`.
pub fn tmp_name(path: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/.{name}.{suffix}.part"),
        None => format!(".{path}.{suffix}.part"),
    }
}

/// Conflict backup name in the same directory as the original:
/// `<basename>_conflict-YYYYMMDD-HHMMSS<ext>`. User-visible and stable.
pub fn conflict_name(path: &str, stamp: OffsetDateTime) -> String {
    let timestring = format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        stamp.year(),
        u8::from(stamp.month()),
        stamp.day(),
        stamp.hour(),
        stamp.minute(),
        stamp.second()
    );
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem}_conflict-{timestring}.{ext}");
    }
    format!("{dir}{name}_conflict-{timestring}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parent_walks_up_to_the_root() {
        assert_eq!(parent_of("a/b/c.txt").as_deref(), Some("a/b"));
        assert_eq!(parent_of("a/b").as_deref(), Some("a"));
        assert_eq!(parent_of("a"), None);
    }

    #[test]
    fn tmp_name_stays_in_the_destination_directory() {
        let name = tmp_name("Docs/A.txt");
        assert!(name.starts_with("Docs/.A.txt."));
        assert!(name.ends_with(".part"));
        assert_ne!(name, tmp_name("Docs/A.txt"));
    }

    #[test]
    fn conflict_name_keeps_directory_and_extension() {
        let stamp = datetime!(2013-05-17 09:30:05 UTC);
        assert_eq!(
            conflict_name("Docs/A.txt", stamp),
            "Docs/A_conflict-20130517-093005.txt"
        );
        assert_eq!(
            conflict_name("README", stamp),
            "README_conflict-20130517-093005"
        );
        assert_eq!(
            conflict_name(".hidden", stamp),
            ".hidden_conflict-20130517-093005"
        );
    }
}

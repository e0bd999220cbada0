//! Titles and branch names derived from the first user message.

const MAX_TITLE_CHARS: usize = 50;
const MAX_SLUG_CHARS: usize = 40;

/// Default title of a session that has not received a message yet.
pub const DEFAULT_TITLE: &str = "New session";

/// First non-empty line with whitespace collapsed, truncated to 50 chars.
pub fn generate_title(message: &str) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if collapsed.chars().count() <= MAX_TITLE_CHARS {
        return collapsed;
    }
    let truncated: String = collapsed.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", truncated.trim_end())
}

/// Lowercase ASCII alphanumeric runs joined by `-`, at most 40 chars.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_ascii_lowercase();
        let sep = usize::from(!slug.is_empty());
        if slug.len() + sep + word.len() > MAX_SLUG_CHARS {
            if slug.is_empty() {
                slug.push_str(&word[..MAX_SLUG_CHARS]);
            }
            break;
        }
        if sep == 1 {
            slug.push('-');
        }
        slug.push_str(&word);
    }
    slug
}

/// `session/<slug>-<first 8 chars of the id>`, or `session/<short id>` when
/// the title has no usable characters.
pub fn branch_name(title: &str, session_id: &str) -> String {
    let short_id: String = session_id.chars().take(8).collect();
    let slug = slugify(title);
    if slug.is_empty() {
        format!("session/{short_id}")
    } else {
        format!("session/{slug}-{short_id}")
    }
}

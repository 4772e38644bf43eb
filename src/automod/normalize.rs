//! Text preparation for the content checks.
//!
//! Code blocks and raw URLs are exempt from text checks and are cut out
//! first. What remains has combining marks removed and look-alike characters
//! folded to ASCII; the filter additionally folds leetspeak.

/// Hosts that serve guild invites
const INVITE_HOSTS: &[&str] = &["discord.gg", "discord.com/invite", "discordapp.com/invite"];

/// Remove fenced and inline code spans and raw URLs.
#[must_use]
pub fn strip_exempt_spans(content: &str) -> String {
    let without_code = strip_code(content);
    without_code
        .split_whitespace()
        .filter(|token| !is_url(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_code(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let fence = if rest[start..].starts_with("```") { "```" } else { "`" };
        let body = &rest[start + fence.len()..];
        match body.find(fence) {
            Some(end) => {
                out.push(' ');
                rest = &body[end + fence.len()..];
            }
            // An unterminated fence is plain text
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '"' | '\'' | ',' | '.'))
}

fn is_url(token: &str) -> bool {
    let token = trim_token(token).to_ascii_lowercase();
    token.starts_with("http://")
        || token.starts_with("https://")
        || INVITE_HOSTS
            .iter()
            .any(|host| token.starts_with(&format!("{host}/")))
}

/// Links in a message, including scheme-less invite links, in order.
/// Code spans are skipped.
#[must_use]
pub fn extract_urls(content: &str) -> Vec<String> {
    strip_code(content)
        .split_whitespace()
        .filter(|token| is_url(token))
        .map(|token| trim_token(token).to_string())
        .collect()
}

/// Host of a URL, lowercased and without `www.`, or the scheme-less host
/// of an invite link
#[must_use]
pub fn domain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest
        .split(['/', '?', '#'])
        .next()?
        .rsplit('@')
        .next()?
        .split(':')
        .next()?
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    (!host.is_empty()).then_some(host)
}

/// Whether `url` is a guild invite link
#[must_use]
pub fn is_invite(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest).to_ascii_lowercase();
    let rest = rest.strip_prefix("www.").unwrap_or(&rest);
    INVITE_HOSTS
        .iter()
        .any(|host| rest.starts_with(&format!("{host}/")))
}

/// Whether `domain` is `allowed` or one of its subdomains
#[must_use]
pub fn domain_matches(domain: &str, allowed: &str) -> bool {
    let allowed = allowed.trim().trim_start_matches("www.").to_ascii_lowercase();
    domain == allowed || domain.ends_with(&format!(".{allowed}"))
}

fn is_combining(c: char) -> bool {
    matches!(
        c as u32,
        0x0300..=0x036F
            | 0x0483..=0x0489
            | 0x1AB0..=0x1AFF
            | 0x1DC0..=0x1DFF
            | 0x20D0..=0x20FF
            | 0xFE20..=0xFE2F
    )
}

/// Drop combining marks ("zalgo").
#[must_use]
pub fn strip_zalgo(text: &str) -> String {
    text.chars().filter(|c| !is_combining(*c)).collect()
}

/// Fold a look-alike character to its ASCII counterpart, keeping case.
fn fold_confusable(c: char) -> char {
    let code = c as u32;
    // Fullwidth ASCII
    if (0xFF01..=0xFF5E).contains(&code) {
        return char::from_u32(code - 0xFEE0).unwrap_or(c);
    }
    // Mathematical bold letters
    if (0x1D400..=0x1D419).contains(&code) {
        return char::from_u32(u32::from(b'A') + code - 0x1D400).unwrap_or(c);
    }
    if (0x1D41A..=0x1D433).contains(&code) {
        return char::from_u32(u32::from(b'a') + code - 0x1D41A).unwrap_or(c);
    }
    match c {
        'а' | 'α' => 'a',
        'А' | 'Α' => 'A',
        'в' | 'В' | 'Β' => 'B',
        'с' | 'ϲ' => 'c',
        'С' => 'C',
        'е' | 'ε' => 'e',
        'Е' | 'Ε' => 'E',
        'Н' | 'Η' => 'H',
        'і' | 'ι' => 'i',
        'І' | 'Ι' => 'I',
        'ј' => 'j',
        'К' | 'Κ' => 'K',
        'М' | 'Μ' => 'M',
        'о' | 'ο' => 'o',
        'О' | 'Ο' => 'O',
        'р' | 'ρ' => 'p',
        'Р' | 'Ρ' => 'P',
        'ѕ' => 's',
        'Т' | 'Τ' => 'T',
        'у' => 'y',
        'υ' | 'ν' => 'v',
        'х' | 'χ' => 'x',
        'Х' | 'Χ' => 'X',
        _ => c,
    }
}

fn fold_leet(c: char) -> char {
    match c {
        '0' => 'o',
        '1' => 'i',
        '3' => 'e',
        '4' | '@' => 'a',
        '5' | '$' => 's',
        '7' | '+' => 't',
        '8' => 'b',
        _ => c,
    }
}

/// Strip zalgo and fold confusables; case is preserved for the caps check.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !is_combining(*c))
        .map(fold_confusable)
        .collect()
}

/// Lowercased, leet-folded words of `text` used for filter matching.
///
/// Each word appears twice when it contains separators: as written, and
/// with the separators removed so `b.a.d` matches `bad`.
#[must_use]
pub fn filter_tokens(text: &str) -> Vec<String> {
    let folded: String = normalize(text)
        .to_lowercase()
        .chars()
        .map(fold_leet)
        .collect();
    let mut tokens = Vec::new();
    for raw in folded.split_whitespace() {
        let word: String = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        let squashed: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
        if squashed != word && !squashed.is_empty() {
            tokens.push(squashed);
        }
        if !word.is_empty() {
            tokens.push(word);
        }
    }
    tokens
}

/// Normalize a configured filter word the same way message words are.
#[must_use]
pub fn filter_word(word: &str) -> String {
    normalize(word)
        .to_lowercase()
        .chars()
        .map(fold_leet)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Letter count and uppercase-letter count of `text`
#[must_use]
pub fn caps_counts(text: &str) -> (usize, usize) {
    text.chars()
        .filter(|c| c.is_alphabetic())
        .fold((0, 0), |(letters, upper), c| {
            (letters + 1, upper + usize::from(c.is_uppercase()))
        })
}

/// Number of user, role and broadcast mentions in raw content
#[must_use]
pub fn count_mentions(content: &str) -> usize {
    content.matches("<@").count()
        + content.matches("@everyone").count()
        + content.matches("@here").count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_exempt_spans() {
        let content = "look ```let x = BAD;``` at `CODE` https://example.com/x and discord.gg/abc ok";
        assert_eq!(strip_exempt_spans(content), "look at and ok");
        assert_eq!(strip_exempt_spans("open ``` fence"), "open ``` fence");
    }

    #[test]
    fn test_extract_urls_skips_code() {
        let urls = extract_urls("see <https://a.example/x>, `https://hidden.test` discord.gg/raid");
        assert_eq!(urls, vec!["https://a.example/x", "discord.gg/raid"]);
    }

    #[test]
    fn test_domains_and_invites() {
        assert_eq!(
            domain_of("https://www.Example.com:8080/path?q").as_deref(),
            Some("example.com")
        );
        assert_eq!(domain_of("discord.gg/abc").as_deref(), Some("discord.gg"));
        assert!(is_invite("https://discord.com/invite/abc"));
        assert!(is_invite("discord.gg/abc"));
        assert!(!is_invite("https://discord.com/channels/1/2"));
        assert!(domain_matches("cdn.example.com", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
    }

    #[test]
    fn test_normalize_folds_confusables_and_zalgo() {
        assert_eq!(strip_zalgo("h\u{0336}e\u{0301}l\u{035c}lo"), "hello");
        assert_eq!(normalize("ｂаd"), "bad");
        assert_eq!(normalize("𝐁𝐀𝐃"), "BAD");
    }

    #[test]
    fn test_filter_tokens_fold_leet_and_separators() {
        let tokens = filter_tokens("you are B.4.D and 5p4m!");
        assert!(tokens.contains(&"bad".to_string()));
        assert!(tokens.contains(&"spam".to_string()));
        assert_eq!(filter_word("B@d"), "bad");
    }

    #[test]
    fn test_caps_and_mentions() {
        assert_eq!(caps_counts("ABC def!"), (6, 3));
        assert_eq!(count_mentions("<@1> <@!2> <@&3> @everyone"), 4);
    }
}

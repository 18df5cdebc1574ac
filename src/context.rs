// Source sites leak reader-facing chrome (ratings, bookmarks, links) into chapter text.
const META_KEYWORDS: &[&str] = &[
    "评论",
    "评分",
    "书签",
    "收藏",
    "点赞",
    "投票",
    "感想",
    "レビュー",
    "評価",
    "ブックマーク",
    "いいね",
    "http",
    "www.",
    ".com",
    "URL",
];

/// Returns the last `n_lines` narrative lines of `text`, for use as continuity context.
pub fn tail(text: &str, n_lines: usize) -> String {
    if n_lines == 0 || text.trim().is_empty() {
        return String::new();
    }

    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let narrative = lines
        .iter()
        .copied()
        .filter(|line| !is_meta_line(line))
        .collect::<Vec<_>>();
    let pool = if narrative.is_empty() {
        &lines
    } else {
        &narrative
    };

    let start = pool.len().saturating_sub(n_lines);
    pool[start..].join("\n")
}

pub fn is_meta_line(line: &str) -> bool {
    let hits = META_KEYWORDS
        .iter()
        .filter(|keyword| line.contains(*keyword))
        .count();
    hits >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_last_lines() {
        let text = "一\n二\n\n三\n四\n";
        assert_eq!(tail(text, 2), "三\n四");
        assert_eq!(tail(text, 10), "一\n二\n三\n四");
    }

    #[test]
    fn zero_lines_or_empty_text_returns_empty() {
        assert_eq!(tail("一\n二", 0), "");
        assert_eq!(tail("  \n", 3), "");
    }

    #[test]
    fn meta_lines_are_filtered() {
        let text = "勇者は歩いた。\n评论 12 | 收藏 300\n魔王が笑った。\nレビュー https://example.com";
        assert_eq!(tail(text, 5), "勇者は歩いた。\n魔王が笑った。");
    }

    #[test]
    fn single_keyword_is_not_meta() {
        assert!(!is_meta_line("他点开了收藏夹。"));
        assert!(is_meta_line("书签 / 点赞"));
    }

    #[test]
    fn falls_back_to_unfiltered_lines_when_all_are_meta() {
        let text = "评论 收藏\n书签 点赞";
        assert_eq!(tail(text, 1), "书签 点赞");
    }
}

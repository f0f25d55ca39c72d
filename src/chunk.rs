//! Text partitioning for retrieval.
//!
//! Extracted text becomes retrieval-sized fragments in two passes.
//! First, paragraphs are reduced to *segments* that each fit the
//! character budget: an oversized paragraph is cut at the last sentence
//! end inside the budget window, falling back to the last whitespace,
//! falling back to a hard cut. Second, segments are packed greedily
//! into [`Partition`]s, reusing the blank-line separator between
//! packed neighbours.
//!
//! A partition's identity is its zero-based index within the file,
//! which keeps downstream artifact keys deterministic across re-runs.
//! The SHA-256 content hash supports change detection.

use sha2::{Digest, Sha256};

/// Approximate chars-per-token ratio used to turn the configured token
/// budget into a character budget.
const CHARS_PER_TOKEN: usize = 4;

/// One retrievable fragment of a file's extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Zero-based, contiguous index within the file.
    pub part_index: usize,
    /// Fragment text.
    pub text: String,
    /// SHA-256 hash of `text`.
    pub hash: String,
}

/// Split text into partitions of at most `max_tokens` (approximated in
/// characters). Indices are contiguous from 0; text with no content
/// yields no partitions.
pub fn partition_text(text: &str, max_tokens: usize) -> Vec<Partition> {
    let budget = max_tokens.saturating_mul(CHARS_PER_TOKEN).max(1);

    let mut segments: Vec<&str> = Vec::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(paragraph) <= budget {
            segments.push(paragraph);
        } else {
            split_oversized(paragraph, budget, &mut segments);
        }
    }

    pack(&segments, budget)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Reduce a paragraph larger than the budget to budget-sized segments.
fn split_oversized<'a>(paragraph: &'a str, budget: usize, out: &mut Vec<&'a str>) {
    let mut rest = paragraph;
    while char_len(rest) > budget {
        let cut = cut_point(rest, budget);
        let (piece, tail) = rest.split_at(cut);
        let piece = piece.trim_end();
        if !piece.is_empty() {
            out.push(piece);
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        out.push(rest);
    }
}

/// Byte offset to cut an oversized paragraph at: the end of the last
/// sentence inside the budget window, else the last whitespace, else
/// the window itself (an unbroken run gets a hard cut).
fn cut_point(s: &str, budget: usize) -> usize {
    let window_end = s
        .char_indices()
        .nth(budget)
        .map(|(offset, _)| offset)
        .unwrap_or(s.len());

    let mut sentence_end = None;
    let mut last_space = None;
    let mut previous: Option<char> = None;
    for (offset, c) in s[..window_end].char_indices() {
        if c.is_whitespace() {
            last_space = Some(offset);
            if matches!(previous, Some('.') | Some('!') | Some('?')) {
                sentence_end = Some(offset);
            }
        }
        previous = Some(c);
    }

    sentence_end
        .or(last_space)
        .filter(|&offset| offset > 0)
        .unwrap_or(window_end)
}

/// Greedily pack segments into partitions, keeping the two-character
/// blank-line separator inside the budget.
fn pack(segments: &[&str], budget: usize) -> Vec<Partition> {
    let mut partitions = Vec::new();
    let mut bucket: Vec<&str> = Vec::new();
    let mut used = 0usize;

    for segment in segments {
        let len = char_len(segment);
        if !bucket.is_empty() && used + 2 + len > budget {
            partitions.push(seal(partitions.len(), &bucket));
            bucket.clear();
            used = 0;
        }
        used += if bucket.is_empty() { len } else { 2 + len };
        bucket.push(segment);
    }
    if !bucket.is_empty() {
        partitions.push(seal(partitions.len(), &bucket));
    }

    partitions
}

fn seal(part_index: usize, segments: &[&str]) -> Partition {
    let text = segments.join("\n\n");
    let hash = format!("{:x}", Sha256::digest(text.as_bytes()));
    Partition {
        part_index,
        text,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_chars(p: &Partition) -> usize {
        p.text.chars().count()
    }

    #[test]
    fn short_paragraphs_pack_into_one_partition() {
        let parts = partition_text("One.\n\nTwo.\n\nThree.", 700);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].part_index, 0);
        assert_eq!(parts[0].text, "One.\n\nTwo.\n\nThree.");
    }

    #[test]
    fn packed_partitions_respect_the_character_budget() {
        let text = (0..40)
            .map(|i| format!("Sentence number {i} padded out a bit."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let parts = partition_text(&text, 20); // 80-char budget

        assert!(parts.len() > 1);
        for p in &parts {
            assert!(total_chars(p) <= 80, "partition over budget: {:?}", p.text);
        }
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.part_index, i);
        }
        // no sentence lost across the packing
        let rebuilt = parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        for i in 0..40 {
            assert!(rebuilt.contains(&format!("Sentence number {i} ")));
        }
    }

    #[test]
    fn oversized_paragraph_is_cut_at_sentence_ends() {
        let para = "First sentence here. Second sentence follows. Third one closes.";
        let parts = partition_text(para, 6); // 24-char budget
        assert!(parts.len() >= 2);
        assert_eq!(parts[0].text, "First sentence here.");
        assert!(parts.iter().all(|p| total_chars(p) <= 24));
    }

    #[test]
    fn unbroken_run_gets_hard_cuts() {
        let run = "x".repeat(100);
        let parts = partition_text(&run, 5); // 20-char budget
        assert_eq!(parts.len(), 5);
        assert!(parts.iter().all(|p| total_chars(p) == 20));
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let para = "é".repeat(50);
        let parts = partition_text(&para, 5); // 20-char budget
        assert!(parts.iter().all(|p| total_chars(p) <= 20));
        let total: usize = parts.iter().map(total_chars).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn blank_input_produces_no_partitions() {
        assert!(partition_text("", 10).is_empty());
        assert!(partition_text(" \n\n \n ", 10).is_empty());
    }

    #[test]
    fn hash_is_sha256_of_the_partition_text() {
        let parts = partition_text("Alpha beta.", 100);
        let expected = format!("{:x}", Sha256::digest(parts[0].text.as_bytes()));
        assert_eq!(parts[0].hash, expected);
    }
}

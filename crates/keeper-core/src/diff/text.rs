//! Line-based text diff.
//!
//! An LCS walk over the two files' lines, rendered as a unified-style
//! patch with zero context lines, plus coarse added/removed/modified line
//! counts. Inputs past the line ceiling (or whose product would make the
//! LCS table unreasonably large) fall back to a common-prefix/suffix trim,
//! which keeps memory bounded at the cost of a coarser patch.

use serde::{Deserialize, Serialize};

/// LCS tables beyond this many cells fall back to the trim diff.
const MAX_LCS_CELLS: usize = 16_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDiff {
    pub added_lines: usize,
    pub removed_lines: usize,
    pub modified_lines: usize,
    pub patch: String,
}

#[derive(Debug, Clone, Copy)]
enum LineOp {
    Equal,
    Remove(usize),
    Insert(usize),
}

pub(crate) fn line_diff(old: &str, new: &str, max_lines: usize) -> TextDiff {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let o = &old_lines[..old_lines.len().min(max_lines)];
    let n = &new_lines[..new_lines.len().min(max_lines)];

    let ops = if (o.len() + 1).saturating_mul(n.len() + 1) <= MAX_LCS_CELLS {
        lcs_ops(o, n)
    } else {
        trim_ops(o, n)
    };
    render_ops(o, n, &ops)
}

fn lcs_ops(o: &[&str], n: &[&str]) -> Vec<LineOp> {
    let rows = o.len();
    let cols = n.len();
    let width = cols + 1;
    let mut dp = vec![0u32; (rows + 1) * width];
    for i in (0..rows).rev() {
        for j in (0..cols).rev() {
            dp[i * width + j] = if o[i] == n[j] {
                dp[(i + 1) * width + j + 1] + 1
            } else {
                dp[(i + 1) * width + j].max(dp[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < rows && j < cols {
        if o[i] == n[j] {
            ops.push(LineOp::Equal);
            i += 1;
            j += 1;
        } else if dp[(i + 1) * width + j] >= dp[i * width + j + 1] {
            ops.push(LineOp::Remove(i));
            i += 1;
        } else {
            ops.push(LineOp::Insert(j));
            j += 1;
        }
    }
    while i < rows {
        ops.push(LineOp::Remove(i));
        i += 1;
    }
    while j < cols {
        ops.push(LineOp::Insert(j));
        j += 1;
    }
    ops
}

/// Coarse fallback: common prefix and suffix are equal, everything between
/// is one remove/insert block.
fn trim_ops(o: &[&str], n: &[&str]) -> Vec<LineOp> {
    let mut prefix = 0;
    while prefix < o.len() && prefix < n.len() && o[prefix] == n[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < o.len() - prefix
        && suffix < n.len() - prefix
        && o[o.len() - 1 - suffix] == n[n.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let mut ops = Vec::new();
    for _ in 0..prefix {
        ops.push(LineOp::Equal);
    }
    for i in prefix..o.len() - suffix {
        ops.push(LineOp::Remove(i));
    }
    for j in prefix..n.len() - suffix {
        ops.push(LineOp::Insert(j));
    }
    for _ in 0..suffix {
        ops.push(LineOp::Equal);
    }
    ops
}

fn render_ops(o: &[&str], n: &[&str], ops: &[LineOp]) -> TextDiff {
    let mut added_lines = 0;
    let mut removed_lines = 0;
    let mut modified_lines = 0;
    let mut patch = String::new();
    let mut old_pos = 0usize;
    let mut new_pos = 0usize;
    let mut idx = 0usize;

    while idx < ops.len() {
        match ops[idx] {
            LineOp::Equal => {
                old_pos += 1;
                new_pos += 1;
                idx += 1;
            }
            _ => {
                let hunk_old_start = old_pos + 1;
                let hunk_new_start = new_pos + 1;
                let mut removed_run: Vec<usize> = Vec::new();
                let mut inserted_run: Vec<usize> = Vec::new();
                while idx < ops.len() {
                    match ops[idx] {
                        LineOp::Remove(i) => {
                            removed_run.push(i);
                            old_pos += 1;
                            idx += 1;
                        }
                        LineOp::Insert(j) => {
                            inserted_run.push(j);
                            new_pos += 1;
                            idx += 1;
                        }
                        LineOp::Equal => break,
                    }
                }
                let paired = removed_run.len().min(inserted_run.len());
                modified_lines += paired;
                removed_lines += removed_run.len() - paired;
                added_lines += inserted_run.len() - paired;

                patch.push_str(&format!(
                    "@@ -{},{} +{},{} @@\n",
                    hunk_old_start,
                    removed_run.len(),
                    hunk_new_start,
                    inserted_run.len()
                ));
                for i in &removed_run {
                    patch.push('-');
                    patch.push_str(o[*i]);
                    patch.push('\n');
                }
                for j in &inserted_run {
                    patch.push('+');
                    patch.push_str(n[*j]);
                    patch.push('\n');
                }
            }
        }
    }

    TextDiff {
        added_lines,
        removed_lines,
        modified_lines,
        patch,
    }
}

use super::{Edit, Hunk, CONTEXT_MARGIN};
use similar::{capture_diff_slices, Algorithm, DiffTag};

/// Flatten a Myers diff into merged equal/delete/insert runs.
fn edit_script(old: &[u8], new: &[u8]) -> Vec<Edit> {
    let mut edits: Vec<Edit> = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, old, new) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => push_edit(&mut edits, Edit::Equal(old[old_range].to_vec())),
            DiffTag::Delete => push_edit(&mut edits, Edit::Delete(old[old_range].to_vec())),
            DiffTag::Insert => push_edit(&mut edits, Edit::Insert(new[new_range].to_vec())),
            DiffTag::Replace => {
                push_edit(&mut edits, Edit::Delete(old[old_range].to_vec()));
                push_edit(&mut edits, Edit::Insert(new[new_range].to_vec()));
            }
        }
    }
    edits
}

fn push_edit(edits: &mut Vec<Edit>, edit: Edit) {
    if edit.bytes().is_empty() {
        return;
    }
    match (edits.last_mut(), edit) {
        (Some(Edit::Equal(prev)), Edit::Equal(next))
        | (Some(Edit::Delete(prev)), Edit::Delete(next))
        | (Some(Edit::Insert(prev)), Edit::Insert(next)) => prev.extend_from_slice(&next),
        (_, edit) => edits.push(edit),
    }
}

/// Group the edit script into hunks, keeping `CONTEXT_MARGIN` bytes of
/// context and merging changes separated by short equal runs.
pub(super) fn make_hunks(old: &[u8], new: &[u8]) -> Vec<Hunk> {
    let edits = edit_script(old, new);
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut pos1 = 0;
    let mut pos2 = 0;

    for (i, edit) in edits.iter().enumerate() {
        match edit {
            Edit::Equal(bytes) => {
                if let Some(mut hunk) = current.take() {
                    let is_last = i + 1 == edits.len();
                    if bytes.len() <= 2 * CONTEXT_MARGIN && !is_last {
                        hunk.edits.push(Edit::Equal(bytes.clone()));
                        current = Some(hunk);
                    } else {
                        let tail = bytes.len().min(CONTEXT_MARGIN);
                        hunk.edits.push(Edit::Equal(bytes[..tail].to_vec()));
                        hunk.recompute_lengths();
                        hunks.push(hunk);
                    }
                }
                pos1 += bytes.len();
                pos2 += bytes.len();
            }
            Edit::Delete(bytes) => {
                current
                    .get_or_insert_with(|| open_hunk(old, pos1, pos2))
                    .edits
                    .push(edit.clone());
                pos1 += bytes.len();
            }
            Edit::Insert(bytes) => {
                current
                    .get_or_insert_with(|| open_hunk(old, pos1, pos2))
                    .edits
                    .push(edit.clone());
                pos2 += bytes.len();
            }
        }
    }

    if let Some(mut hunk) = current {
        hunk.recompute_lengths();
        hunks.push(hunk);
    }
    hunks
}

/// Start a hunk at the current positions, pulling leading context from `old`.
///
/// Everything immediately before a fresh hunk is unchanged text, so the same
/// context length applies to both offsets.
fn open_hunk(old: &[u8], pos1: usize, pos2: usize) -> Hunk {
    let ctx = pos1.min(pos2).min(CONTEXT_MARGIN);
    let mut hunk = Hunk {
        start1: pos1 - ctx,
        start2: pos2 - ctx,
        ..Hunk::default()
    };
    if ctx > 0 {
        hunk.edits.push(Edit::Equal(old[pos1 - ctx..pos1].to_vec()));
    }
    hunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_has_leading_context() {
        let hunks = make_hunks(b"abc", b"abcd");
        assert_eq!(hunks.len(), 1);
        let hunk = &hunks[0];
        assert_eq!(hunk.start1, 0);
        assert_eq!(hunk.start2, 0);
        assert_eq!(hunk.length1, 3);
        assert_eq!(hunk.length2, 4);
        assert_eq!(
            hunk.edits,
            vec![Edit::Equal(b"abc".to_vec()), Edit::Insert(b"d".to_vec())]
        );
    }

    #[test]
    fn test_context_is_capped() {
        let hunks = make_hunks(b"0123456789", b"01234X56789");
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].source(), b"12345678".to_vec());
        assert_eq!(hunks[0].target(), b"1234X5678".to_vec());
        assert_eq!(hunks[0].start1, 1);
    }

    #[test]
    fn test_replace_becomes_delete_then_insert() {
        let script = edit_script(b"cat", b"cut");
        assert_eq!(
            script,
            vec![
                Edit::Equal(b"c".to_vec()),
                Edit::Delete(b"a".to_vec()),
                Edit::Insert(b"u".to_vec()),
                Edit::Equal(b"t".to_vec()),
            ]
        );
    }
}

//! Leaf traversal and in-place mutation

use super::{MimeError, Part};

/// Depth-first, left-to-right iterator over the leaves of a part tree.
///
/// Holds no state beyond its own stack; call [`leaves`] again to restart.
pub struct Leaves<'a> {
    stack: Vec<&'a Part>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a Part;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(part) = self.stack.pop() {
            if part.is_leaf() {
                return Some(part);
            }
            self.stack.extend(part.children().iter().rev());
        }
        None
    }
}

/// Leaves of `root` in document order. A leaf root yields exactly itself.
pub fn leaves(root: &Part) -> Leaves<'_> {
    Leaves { stack: vec![root] }
}

/// Mutable leaves of `root` in document order
pub fn leaves_mut(root: &mut Part) -> Vec<&mut Part> {
    fn collect<'a>(part: &'a mut Part, out: &mut Vec<&'a mut Part>) {
        if part.is_leaf() {
            out.push(part);
        } else {
            for child in part.children_mut() {
                collect(child, out);
            }
        }
    }

    let mut out = Vec::new();
    collect(root, &mut out);
    out
}

/// Replace the raw body of a leaf in place
pub fn replace_leaf_body(part: &mut Part, new_bytes: impl Into<Vec<u8>>) -> Result<(), MimeError> {
    part.set_raw_body(new_bytes)
}

/// First leaf with the given media type
pub fn find_leaf<'a>(root: &'a Part, content_type: &str) -> Option<&'a Part> {
    leaves(root).find(|p| p.content_type.eq_ignore_ascii_case(content_type))
}

/// First leaf with the given media type, mutably
pub fn find_leaf_mut<'a>(root: &'a mut Part, content_type: &str) -> Option<&'a mut Part> {
    leaves_mut(root)
        .into_iter()
        .find(|p| p.content_type.eq_ignore_ascii_case(content_type))
}

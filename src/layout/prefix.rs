//! Shortest-unique-prefix tables for path component resolution
//!
//! Each container carries an alphabetically sorted table of
//! (shortest-unique-prefix, full-name, child-slot) entries. Resolving one
//! path component walks the table once, with an early exit as soon as an
//! entry alphabetically passes the component. A match requires full-name
//! equality, the prefix only bounds how many characters must be compared
//! before the candidate is worth checking.

#[derive(Debug, Clone)]
struct PrefixEntry {
    prefix: String,
    name: String,
    child: usize,
}

/// Per-container component lookup table.
#[derive(Debug, Clone, Default)]
pub struct PrefixIndex {
    entries: Vec<PrefixEntry>,
}

impl PrefixIndex {
    /// Empty index for scalar nodes.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Build the index for a unit whose children are already sorted
    /// alphabetically; entry order mirrors child order.
    pub(crate) fn for_unit(names: &[&str]) -> Self {
        let prefixes = shortest_unique(names);
        let entries = names
            .iter()
            .zip(prefixes)
            .enumerate()
            .map(|(child, (name, prefix))| PrefixEntry {
                prefix,
                name: (*name).to_string(),
                child,
            })
            .collect();
        Self { entries }
    }

    /// Build the degenerate index for an array: every index string is its
    /// own prefix. Entries are sorted alphabetically so the early exit
    /// stays sound past ten elements, while `child` keeps the numeric
    /// slot.
    pub(crate) fn for_array(len: usize) -> Self {
        let mut entries: Vec<PrefixEntry> = (0..len)
            .map(|i| {
                let name = i.to_string();
                PrefixEntry {
                    prefix: name.clone(),
                    name,
                    child: i,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    /// Resolve one path component to a child slot.
    pub(crate) fn lookup(&self, component: &str) -> Option<usize> {
        let comp = component.as_bytes();
        for entry in &self.entries {
            let prefix = entry.prefix.as_bytes();
            let mut j = 0;
            while j < prefix.len() && j < comp.len() && prefix[j] == comp[j] {
                j += 1;
            }
            if j == prefix.len() {
                if entry.name == component {
                    return Some(entry.child);
                }
                if entry.name.len() == component.len() {
                    // Same length, same prefix, different tail: the unique
                    // prefix guarantees no later sibling can match either.
                    return None;
                }
                // Prefix matched but lengths differ, keep scanning
            } else if j == comp.len() || prefix[j] > comp[j] {
                // Entries are sorted; we have passed the component
                return None;
            }
        }
        None
    }
}

/// Shortest prefix of each name that is unique among its sorted siblings:
/// the run of characters shared with either neighbor, plus one.
fn shortest_unique(names: &[&str]) -> Vec<String> {
    let n = names.len();
    (0..n)
        .map(|i| {
            let name = names[i];
            let shared = if n == 1 {
                0
            } else if i == 0 {
                common_len(name, names[1])
            } else if i == n - 1 {
                common_len(name, names[i - 1])
            } else {
                let bytes = name.as_bytes();
                let prev = names[i - 1].as_bytes();
                let next = names[i + 1].as_bytes();
                let mut j = 0;
                while j < bytes.len()
                    && ((j < prev.len() && bytes[j] == prev[j])
                        || (j < next.len() && bytes[j] == next[j]))
                {
                    j += 1;
                }
                j
            };
            let take = (shared + 1).min(name.len());
            name[..take].to_string()
        })
        .collect()
}

fn common_len(a: &str, b: &str) -> usize {
    a.bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shortest_unique_prefixes() {
        // The middle entry extends while matching either neighbor at the
        // same position: "altitude" shares "al" with "alpha" and then 't'
        // with "beta" at index 2.
        let prefixes = shortest_unique(&["alpha", "altitude", "beta"]);
        assert_eq!(prefixes, ["alp", "alti", "b"]);

        let prefixes = shortest_unique(&["only"]);
        assert_eq!(prefixes, ["o"]);

        // One name fully prefixing another caps at the shorter length
        let prefixes = shortest_unique(&["ab", "abc"]);
        assert_eq!(prefixes, ["ab", "abc"]);
    }

    #[test]
    fn test_unit_lookup() {
        let index = PrefixIndex::for_unit(&["alpha", "altitude", "beta"]);
        assert_eq!(index.lookup("alpha"), Some(0));
        assert_eq!(index.lookup("altitude"), Some(1));
        assert_eq!(index.lookup("beta"), Some(2));
        assert_eq!(index.lookup("alp"), None);
        assert_eq!(index.lookup("gamma"), None);
        assert_eq!(index.lookup(""), None);
    }

    #[test]
    fn test_prefix_of_sibling() {
        let index = PrefixIndex::for_unit(&["ab", "abc"]);
        assert_eq!(index.lookup("ab"), Some(0));
        assert_eq!(index.lookup("abc"), Some(1));
        assert_eq!(index.lookup("abcd"), None);
    }

    #[test]
    fn test_array_lookup_past_ten() {
        let index = PrefixIndex::for_array(12);
        for i in 0..12 {
            assert_eq!(index.lookup(&i.to_string()), Some(i));
        }
        assert_eq!(index.lookup("12"), None);
        assert_eq!(index.lookup("x"), None);
    }
}

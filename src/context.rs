use crate::CanonicalName;

/// Retrieved documents grouped per member, in resolver order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityResults {
    entries: Vec<(CanonicalName, Vec<String>)>,
}

impl EntityResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: CanonicalName, documents: Vec<String>) {
        self.entries.push((name, documents));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalName, &[String])> {
        self.entries.iter().map(|(name, docs)| (name, docs.as_slice()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_documents(&self) -> usize {
        self.entries.iter().map(|(_, docs)| docs.len()).sum()
    }
}

impl FromIterator<(CanonicalName, Vec<String>)> for EntityResults {
    fn from_iter<T: IntoIterator<Item = (CanonicalName, Vec<String>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Renders documents as `- <text>\n` lines, byte-for-byte as retrieved.
pub fn assemble_lines<'a, I>(documents: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for doc in documents {
        out.push_str("- ");
        out.push_str(doc);
        out.push('\n');
    }
    out
}

/// Concatenates every member's documents in insertion order.
pub fn assemble(results: &EntityResults) -> String {
    assemble_lines(
        results
            .iter()
            .flat_map(|(_, docs)| docs.iter().map(String::as_str)),
    )
}

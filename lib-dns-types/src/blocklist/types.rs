use std::fmt;

use crate::protocol::types::LABEL_MAX_LEN;

/// A set of blocked domain suffixes.
///
/// The suffixes are stored as a trie whose edges are labels, walked
/// in reverse label order (top-level label first): inserting
/// `ads.example.com` produces the path `com -> example -> ads`, with
/// the final node marked terminal.  A lookup walks its own labels the
/// same way and is blocked as soon as it reaches a terminal node, so
/// a blocked suffix blocks every subdomain beneath it and lookup cost
/// is proportional to the label count, not the blocklist size.
///
/// Children are held per node in plain vectors, scanned linearly.
/// The trie is built once at startup and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    children: Vec<Node>,
    len: usize,
}

#[derive(Debug, Clone)]
struct Node {
    label: String,
    children: Vec<Node>,
    terminal: bool,
}

impl Node {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            children: Vec::new(),
            terminal: false,
        }
    }
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of distinct blocked suffixes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a domain (and so all its subdomains) to the blocklist.
    /// Inserting a domain that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// If the domain fails normalisation.
    pub fn insert(&mut self, domain: &str) -> Result<(), Error> {
        let normalised = normalise(domain)?;
        let labels: Vec<&str> = normalised.split('.').rev().collect();

        if insert_labels(&mut self.children, &labels) {
            self.len += 1;
        }
        Ok(())
    }

    /// True if the name, or any suffix of it by whole labels, is on
    /// the blocklist.  A name that fails normalisation is not
    /// blocked.
    pub fn is_blocked(&self, name: &str) -> bool {
        let normalised = match normalise(name) {
            Ok(normalised) => normalised,
            Err(_) => return false,
        };

        let mut children = &self.children;
        for label in normalised.split('.').rev() {
            match children.iter().find(|node| node.label == label) {
                Some(node) if node.terminal => return true,
                Some(node) => children = &node.children,
                None => return false,
            }
        }

        false
    }
}

/// Walk (and extend) the trie along the given labels, marking the
/// last node terminal.  True if the terminal flag was newly set.
fn insert_labels(children: &mut Vec<Node>, labels: &[&str]) -> bool {
    let (label, rest) = match labels.split_first() {
        Some(split) => split,
        None => return false,
    };

    let index = match children.iter().position(|node| node.label == *label) {
        Some(index) => index,
        None => {
            children.push(Node::new(label));
            children.len() - 1
        }
    };

    if rest.is_empty() {
        let node = &mut children[index];
        if node.terminal {
            false
        } else {
            node.terminal = true;
            true
        }
    } else {
        insert_labels(&mut children[index].children, rest)
    }
}

/// Normalise a domain for insertion or lookup:
///
/// - strip leading and trailing ASCII whitespace
/// - lowercase ASCII letters (other bytes pass through)
/// - strip trailing dots
///
/// Strings which are left empty, contain an empty label, or contain a
/// label over 63 octets are rejected.
///
/// # Errors
///
/// If the domain is rejected.
pub fn normalise(domain: &str) -> Result<String, Error> {
    let stripped = domain.trim_matches(|c: char| c.is_ascii_whitespace());
    if stripped.is_empty() || stripped.bytes().all(|octet| octet == b'.') {
        return Err(Error::Empty);
    }

    let lowered = stripped.to_ascii_lowercase();
    let trimmed = lowered.trim_end_matches('.');

    if trimmed.starts_with('.') || trimmed.contains("..") {
        return Err(Error::EmptyLabel);
    }

    for label in trimmed.split('.') {
        if label.len() > LABEL_MAX_LEN {
            return Err(Error::LabelTooLong);
        }
    }

    Ok(trimmed.to_owned())
}

/// Ways a domain can fail normalisation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// Nothing left after stripping whitespace and dots.
    Empty,

    /// A leading dot or two adjacent dots.
    EmptyLabel,

    /// A label over 63 octets.
    LabelTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Empty => write!(f, "empty domain"),
            Error::EmptyLabel => write!(f, "empty label"),
            Error::LabelTooLong => write!(f, "label over {LABEL_MAX_LEN} octets"),
        }
    }
}

impl std::error::Error for Error {}

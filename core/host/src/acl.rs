//! Allow-list access control.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use cloudshelf_common::{CallerIdentity, FileRef, Result};

use crate::ports::AccessControl;

/// Matches every caller or every entity type.
pub const WILDCARD: &str = "*";

/// Static caller to entity-type allow list.
///
/// A caller may read a file when its entry (or the `*` entry) lists the
/// file's entity type or `*`. Everything else is denied.
#[derive(Debug, Clone, Default)]
pub struct AllowListAcl {
    rules: HashMap<String, HashSet<String>>,
}

impl AllowListAcl {
    /// Create an empty allow list that denies everyone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `caller -> [entity types]` rules, as found in config files.
    pub fn from_rules(rules: &HashMap<String, Vec<String>>) -> Self {
        let mut acl = Self::new();
        for (caller, entity_types) in rules {
            for entity_type in entity_types {
                acl.allow(caller.clone(), entity_type.clone());
            }
        }
        acl
    }

    /// Allow `caller` to read files of `entity_type`.
    pub fn allow(&mut self, caller: impl Into<String>, entity_type: impl Into<String>) {
        self.rules
            .entry(caller.into())
            .or_default()
            .insert(entity_type.into());
    }

    fn permits(&self, caller: &str, entity_type: &str) -> bool {
        [caller, WILDCARD].iter().any(|key| {
            self.rules
                .get(*key)
                .is_some_and(|types| types.contains(entity_type) || types.contains(WILDCARD))
        })
    }
}

#[async_trait]
impl AccessControl for AllowListAcl {
    async fn can_access(&self, caller: &CallerIdentity, file: &FileRef) -> Result<bool> {
        Ok(self.permits(caller.as_str(), &file.entity_type))
    }
}

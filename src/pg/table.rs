//! Membership table
//!
//! A per-group multiset of members with no I/O. Occurrences are counted, so a
//! member joined twice must leave twice. The maps are persistent (`im`), which
//! makes [`MembershipTable::view`] an O(1) immutable snapshot that readers can
//! hold while the owner keeps mutating.

use std::collections::BTreeMap;

use im::HashMap as ImHashMap;

use crate::types::{GroupName, Member, NodeId};

/// Occurrence counts of each member in one group
type Occurrences = ImHashMap<Member, usize>;

/// Full local state of one node, keyed by group
pub type GroupSnapshot = BTreeMap<GroupName, Vec<Member>>;

/// Changes produced by a bulk operation, per group
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TableDiff {
    pub joined: BTreeMap<GroupName, Vec<Member>>,
    pub left: BTreeMap<GroupName, Vec<Member>>,
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Immutable point-in-time view of a [`MembershipTable`]
#[derive(Debug, Clone, Default)]
pub struct MembershipView {
    groups: ImHashMap<GroupName, Occurrences>,
}

impl MembershipView {
    /// Every occurrence in `group`, sorted
    pub fn members(&self, group: &str) -> Vec<Member> {
        self.groups.get(group).map(expand).unwrap_or_default()
    }

    /// Occurrences in `group` owned by `node`
    pub fn members_on(&self, group: &str, node: NodeId) -> Vec<Member> {
        self.members(group)
            .into_iter()
            .filter(|member| member.node == node)
            .collect()
    }

    /// Number of occurrences in `group`
    pub fn count(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map(|occurrences| occurrences.values().sum())
            .unwrap_or(0)
    }

    /// Names of all non-empty groups, sorted
    pub fn groups(&self) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = self.groups.keys().cloned().collect();
        names.sort();
        names
    }
}

fn expand(occurrences: &Occurrences) -> Vec<Member> {
    let mut members: Vec<Member> = occurrences
        .iter()
        .flat_map(|(member, count)| std::iter::repeat(*member).take(*count))
        .collect();
    members.sort();
    members
}

/// Per-group multiset of members
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    groups: ImHashMap<GroupName, Occurrences>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence of `member` to `group`
    pub fn add(&mut self, group: &str, member: Member) {
        match self.groups.get_mut(group) {
            Some(occurrences) => {
                let count = occurrences.get(&member).copied().unwrap_or(0);
                occurrences.insert(member, count + 1);
            }
            None => {
                self.groups.insert(group.to_string(), ImHashMap::unit(member, 1));
            }
        }
    }

    /// Remove one occurrence of `member` from `group`. Returns false if absent.
    pub fn remove(&mut self, group: &str, member: &Member) -> bool {
        let Some(occurrences) = self.groups.get_mut(group) else {
            return false;
        };
        match occurrences.get(member).copied() {
            None => return false,
            Some(1) => {
                occurrences.remove(member);
            }
            Some(count) => {
                occurrences.insert(*member, count - 1);
            }
        }
        if occurrences.is_empty() {
            self.groups.remove(group);
        }
        true
    }

    /// Remove every entry owned by `node`. Idempotent.
    pub fn purge_by_owner(&mut self, node: NodeId) -> GroupSnapshot {
        let mut removed = GroupSnapshot::new();
        let names: Vec<GroupName> = self.groups.keys().cloned().collect();

        for name in names {
            let Some(occurrences) = self.groups.get_mut(&name) else {
                continue;
            };
            let owned: Vec<(Member, usize)> = occurrences
                .iter()
                .filter(|(member, _)| member.node == node)
                .map(|(member, count)| (*member, *count))
                .collect();
            if owned.is_empty() {
                continue;
            }

            let gone = removed.entry(name.clone()).or_default();
            for (member, count) in owned {
                occurrences.remove(&member);
                gone.extend(std::iter::repeat(member).take(count));
            }
            if occurrences.is_empty() {
                self.groups.remove(&name);
            }
        }
        removed
    }

    /// Copy of every occurrence in `group`
    pub fn snapshot(&self, group: &str) -> Vec<Member> {
        self.groups.get(group).map(expand).unwrap_or_default()
    }

    /// Everything owned by `node`, grouped
    pub fn owned_by(&self, node: NodeId) -> GroupSnapshot {
        let mut owned = GroupSnapshot::new();
        for (name, occurrences) in self.groups.iter() {
            let members: Vec<Member> = expand(occurrences)
                .into_iter()
                .filter(|member| member.node == node)
                .collect();
            if !members.is_empty() {
                owned.insert(name.clone(), members);
            }
        }
        owned
    }

    /// Replace all entries owned by `node` with `snapshot`, returning the
    /// per-group difference against what was there before.
    pub fn replace_owner(&mut self, node: NodeId, snapshot: &GroupSnapshot) -> TableDiff {
        let before = self.owned_by(node);
        self.purge_by_owner(node);
        for (group, members) in snapshot {
            for member in members {
                self.add(group, *member);
            }
        }

        let mut diff = TableDiff::default();
        let mut names: Vec<&GroupName> = before.keys().chain(snapshot.keys()).collect();
        names.sort();
        names.dedup();

        for name in names {
            let old = counts(before.get(name));
            let new = counts(snapshot.get(name));
            let mut joined = Vec::new();
            let mut left = Vec::new();

            for (member, &n) in &new {
                let o = old.get(member).copied().unwrap_or(0);
                joined.extend(std::iter::repeat(*member).take(n.saturating_sub(o)));
            }
            for (member, &o) in &old {
                let n = new.get(member).copied().unwrap_or(0);
                left.extend(std::iter::repeat(*member).take(o.saturating_sub(n)));
            }
            if !joined.is_empty() {
                diff.joined.insert(name.clone(), joined);
            }
            if !left.is_empty() {
                diff.left.insert(name.clone(), left);
            }
        }
        diff
    }

    /// Occurrences of `member` in `group`
    pub fn occurrences(&self, group: &str, member: &Member) -> usize {
        self.groups
            .get(group)
            .and_then(|occurrences| occurrences.get(member).copied())
            .unwrap_or(0)
    }

    /// Cheap immutable snapshot of the whole table
    pub fn view(&self) -> MembershipView {
        MembershipView { groups: self.groups.clone() }
    }
}

fn counts(members: Option<&Vec<Member>>) -> BTreeMap<Member, usize> {
    let mut counts = BTreeMap::new();
    for member in members.into_iter().flatten() {
        *counts.entry(*member).or_insert(0) += 1;
    }
    counts
}

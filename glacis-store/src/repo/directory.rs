//! Persons, source IPs, backends and group trees.

use diesel::prelude::*;
use ipnetwork::IpNetwork;

use crate::error::{StoreError, StoreResult};
use crate::models::{Backend, GroupNode, NewBackend, NewPerson, NewSourceIp, Person, SourceIp};
use crate::schema::{
    backends, persons, server_group_members, server_groups, source_ips, user_group_members,
    user_groups,
};

const MAX_GROUP_DEPTH: usize = 10;

/// Which of the two structurally identical group trees to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTree {
    Servers,
    Users,
}

pub struct DirectoryRepo;

impl DirectoryRepo {
    pub fn create_person(conn: &mut PgConnection, new: NewPerson) -> StoreResult<Person> {
        let person = diesel::insert_into(persons::table)
            .values(&new)
            .get_result::<Person>(conn)?;
        Ok(person)
    }

    pub fn person_by_handle(conn: &mut PgConnection, handle: &str) -> StoreResult<Person> {
        persons::table
            .filter(persons::handle.eq(handle))
            .filter(persons::active.eq(true))
            .first::<Person>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "person",
                id: handle.to_string(),
            })
    }

    pub fn active_persons(conn: &mut PgConnection) -> StoreResult<Vec<Person>> {
        Ok(persons::table
            .filter(persons::active.eq(true))
            .load::<Person>(conn)?)
    }

    /// Register a source IP for a person. Rejects any overlap with another
    /// active source IP, including an overlapping CIDR for a different
    /// person: an address must map to at most one active person.
    pub fn add_source_ip(conn: &mut PgConnection, new: NewSourceIp) -> StoreResult<SourceIp> {
        conn.transaction::<_, StoreError, _>(|conn| {
            let existing = source_ips::table
                .filter(source_ips::active.eq(true))
                .load::<SourceIp>(conn)?;
            for other in &existing {
                if networks_overlap(&other.cidr, &new.cidr) {
                    return Err(StoreError::Conflict(format!(
                        "source IP {} overlaps active entry {} (person {})",
                        new.cidr, other.cidr, other.person_id
                    )));
                }
            }
            let row = diesel::insert_into(source_ips::table)
                .values(&new)
                .get_result::<SourceIp>(conn)?;
            Ok(row)
        })
    }

    pub fn active_source_ips(conn: &mut PgConnection) -> StoreResult<Vec<SourceIp>> {
        Ok(source_ips::table
            .filter(source_ips::active.eq(true))
            .load::<SourceIp>(conn)?)
    }

    pub fn create_backend(conn: &mut PgConnection, new: NewBackend) -> StoreResult<Backend> {
        let backend = diesel::insert_into(backends::table)
            .values(&new)
            .get_result::<Backend>(conn)?;
        Ok(backend)
    }

    pub fn backend_by_name(conn: &mut PgConnection, name: &str) -> StoreResult<Backend> {
        backends::table
            .filter(backends::name.eq(name))
            .filter(backends::active.eq(true))
            .first::<Backend>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "backend",
                id: name.to_string(),
            })
    }

    pub fn backend_by_id(conn: &mut PgConnection, id: i32) -> StoreResult<Backend> {
        backends::table
            .find(id)
            .first::<Backend>(conn)
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "backend",
                id: id.to_string(),
            })
    }

    pub fn active_backends(conn: &mut PgConnection) -> StoreResult<Vec<Backend>> {
        Ok(backends::table
            .filter(backends::active.eq(true))
            .load::<Backend>(conn)?)
    }

    /// Create a group node. A fresh node cannot close a cycle, so only
    /// the parent's existence is checked.
    pub fn create_group(
        conn: &mut PgConnection,
        tree: GroupTree,
        name: &str,
        parent_id: Option<i32>,
    ) -> StoreResult<GroupNode> {
        if let Some(parent) = parent_id {
            let nodes = Self::group_nodes(conn, tree)?;
            if !nodes.iter().any(|n| n.id == parent) {
                return Err(StoreError::NotFound {
                    entity: "group",
                    id: parent.to_string(),
                });
            }
        }
        let node = match tree {
            GroupTree::Servers => diesel::insert_into(server_groups::table)
                .values((
                    server_groups::name.eq(name),
                    server_groups::parent_id.eq(parent_id),
                ))
                .returning((server_groups::id, server_groups::name, server_groups::parent_id))
                .get_result::<GroupNode>(conn)?,
            GroupTree::Users => diesel::insert_into(user_groups::table)
                .values((user_groups::name.eq(name), user_groups::parent_id.eq(parent_id)))
                .returning((user_groups::id, user_groups::name, user_groups::parent_id))
                .get_result::<GroupNode>(conn)?,
        };
        Ok(node)
    }

    /// Add a member to one group tree.
    pub fn add_group_member(
        conn: &mut PgConnection,
        tree: GroupTree,
        group_id: i32,
        member_id: i32,
    ) -> StoreResult<()> {
        match tree {
            GroupTree::Servers => {
                diesel::insert_into(server_group_members::table)
                    .values((
                        server_group_members::group_id.eq(group_id),
                        server_group_members::backend_id.eq(member_id),
                    ))
                    .execute(conn)?;
            }
            GroupTree::Users => {
                diesel::insert_into(user_group_members::table)
                    .values((
                        user_group_members::group_id.eq(group_id),
                        user_group_members::person_id.eq(member_id),
                    ))
                    .execute(conn)?;
            }
        }
        Ok(())
    }

    /// All nodes of one group tree.
    pub fn group_nodes(conn: &mut PgConnection, tree: GroupTree) -> StoreResult<Vec<GroupNode>> {
        let nodes = match tree {
            GroupTree::Servers => server_groups::table
                .select((server_groups::id, server_groups::name, server_groups::parent_id))
                .load::<GroupNode>(conn)?,
            GroupTree::Users => user_groups::table
                .select((user_groups::id, user_groups::name, user_groups::parent_id))
                .load::<GroupNode>(conn)?,
        };
        Ok(nodes)
    }

    /// Membership pairs `(group_id, member_id)` of one tree.
    pub fn group_members(
        conn: &mut PgConnection,
        tree: GroupTree,
    ) -> StoreResult<Vec<(i32, i32)>> {
        let pairs = match tree {
            GroupTree::Servers => server_group_members::table
                .select((server_group_members::group_id, server_group_members::backend_id))
                .load::<(i32, i32)>(conn)?,
            GroupTree::Users => user_group_members::table
                .select((user_group_members::group_id, user_group_members::person_id))
                .load::<(i32, i32)>(conn)?,
        };
        Ok(pairs)
    }

    /// Re-parent a group. The write is rejected if it would create a cycle
    /// reachable from the written node, or a chain deeper than the cap.
    pub fn set_group_parent(
        conn: &mut PgConnection,
        tree: GroupTree,
        group_id: i32,
        new_parent: Option<i32>,
    ) -> StoreResult<()> {
        conn.transaction::<_, StoreError, _>(|conn| {
            let nodes = Self::group_nodes(conn, tree)?;
            let parents: std::collections::HashMap<i32, Option<i32>> =
                nodes.iter().map(|n| (n.id, n.parent_id)).collect();
            if !parents.contains_key(&group_id) {
                return Err(StoreError::NotFound {
                    entity: "group",
                    id: group_id.to_string(),
                });
            }

            if let Some(parent) = new_parent {
                let mut cursor = Some(parent);
                let mut depth = 0usize;
                while let Some(node) = cursor {
                    if node == group_id {
                        return Err(StoreError::Constraint(format!(
                            "re-parenting group {group_id} under {parent} creates a cycle"
                        )));
                    }
                    depth += 1;
                    if depth > MAX_GROUP_DEPTH {
                        return Err(StoreError::Constraint(format!(
                            "group chain deeper than {MAX_GROUP_DEPTH}"
                        )));
                    }
                    cursor = parents.get(&node).copied().flatten();
                }
            }

            match tree {
                GroupTree::Servers => {
                    diesel::update(server_groups::table.find(group_id))
                        .set(server_groups::parent_id.eq(new_parent))
                        .execute(conn)?;
                }
                GroupTree::Users => {
                    diesel::update(user_groups::table.find(group_id))
                        .set(user_groups::parent_id.eq(new_parent))
                        .execute(conn)?;
                }
            }
            Ok(())
        })
    }
}

/// True if the two networks share any address.
pub fn networks_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_networks_overlap_identical() {
        let a: IpNetwork = "100.64.0.20/32".parse().unwrap();
        assert!(networks_overlap(&a, &a));
    }

    #[test]
    fn test_networks_overlap_subnet() {
        let a: IpNetwork = "100.64.0.0/24".parse().unwrap();
        let b: IpNetwork = "100.64.0.20/32".parse().unwrap();
        assert!(networks_overlap(&a, &b));
        assert!(networks_overlap(&b, &a));
    }

    #[test]
    fn test_networks_disjoint() {
        let a: IpNetwork = "100.64.0.0/24".parse().unwrap();
        let b: IpNetwork = "100.64.1.0/24".parse().unwrap();
        assert!(!networks_overlap(&a, &b));
    }

    #[test]
    fn test_networks_mixed_family_disjoint() {
        let a: IpNetwork = "100.64.0.0/24".parse().unwrap();
        let b: IpNetwork = "fd00::1/128".parse().unwrap();
        assert!(!networks_overlap(&a, &b));
    }
}

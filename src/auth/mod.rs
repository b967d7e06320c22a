//! The authentication store.
//!
//! Users, roles and the enabled flag live in the `auth*` buckets and change
//! only through applied entries. When auth is enabled, the applier consults
//! [`AuthStore::is_op_permitted`] before touching the key space.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::errors::ApplyError;
use crate::storage::Backend;
use crate::storage::BatchTx;
use crate::storage::Bucket;
use crate::storage::TxReader;

const ENABLED_KEY: &[u8] = b"authEnabled";
const REVISION_KEY: &[u8] = b"authRevision";
const ROOT_USER: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    ReadWrite,
}

impl Permission {
    fn allows(&self, want: Permission) -> bool {
        match (self, want) {
            (Permission::ReadWrite, _) => true,
            (Permission::Read, Permission::Read) => true,
            (Permission::Write, Permission::Write) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPermission {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    pub perm: Permission,
}

impl KeyPermission {
    fn covers(&self, key: &[u8], range_end: Option<&[u8]>) -> bool {
        match (&self.range_end, range_end) {
            (None, None) => self.key == key,
            (Some(pe), None) => {
                self.key.as_slice() <= key && (pe.as_slice() == [0] || key < pe.as_slice())
            }
            (Some(pe), Some(re)) => {
                self.key.as_slice() <= key && (pe.as_slice() == [0] || (re != [0] && re <= pe.as_slice()))
            }
            (None, Some(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    password_hash: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub perms: Vec<KeyPermission>,
}

/// Enabled flag and current revision of the auth store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub enabled: bool,
    pub revision: u64,
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The auth store. Mutations run inside the applier's transaction; the
/// enabled flag and revision are cached for the hot permission-check path.
pub struct AuthStore {
    be: Arc<Backend>,
    enabled: AtomicBool,
    revision: AtomicU64,
}

impl AuthStore {
    pub fn new(be: Arc<Backend>) -> Self {
        let store = Self {
            be,
            enabled: AtomicBool::new(false),
            revision: AtomicU64::new(1),
        };
        store.restore();
        store
    }

    /// Reload cached state from the auth buckets.
    pub fn restore(&self) {
        let tx = self.be.read_tx();
        let enabled = tx.unsafe_get(Bucket::Auth, ENABLED_KEY).map(|v| v == b"true").unwrap_or(false);
        let revision = tx
            .unsafe_get(Bucket::Auth, REVISION_KEY)
            .map(|v| u64::from_be_bytes(v[..8].try_into().unwrap()))
            .unwrap_or(1);
        self.enabled.store(enabled, Ordering::Release);
        self.revision.store(revision, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> AuthStatus {
        AuthStatus {
            enabled: self.is_enabled(),
            revision: self.revision.load(Ordering::Acquire),
        }
    }

    fn bump_revision(&self, tx: &mut BatchTx<'_>) -> u64 {
        let rev = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        tx.unsafe_put(Bucket::Auth, REVISION_KEY, &rev.to_be_bytes());
        rev
    }

    fn read_user(tx: &impl TxReader, name: &str) -> Option<User> {
        let raw = tx.unsafe_get(Bucket::AuthUsers, name.as_bytes())?;
        Some(serde_json::from_slice(&raw).expect("user record is well formed"))
    }

    fn read_role(tx: &impl TxReader, name: &str) -> Option<Role> {
        let raw = tx.unsafe_get(Bucket::AuthRoles, name.as_bytes())?;
        Some(serde_json::from_slice(&raw).expect("role record is well formed"))
    }

    fn write_user(tx: &mut BatchTx<'_>, user: &User) {
        tx.unsafe_put(
            Bucket::AuthUsers,
            user.name.as_bytes(),
            &serde_json::to_vec(user).expect("user serializes"),
        );
    }

    fn write_role(tx: &mut BatchTx<'_>, role: &Role) {
        tx.unsafe_put(
            Bucket::AuthRoles,
            role.name.as_bytes(),
            &serde_json::to_vec(role).expect("role serializes"),
        );
    }

    /// Enable auth. Requires the root user so the cluster cannot lock itself
    /// out.
    pub fn enable(&self, tx: &mut BatchTx<'_>) -> Result<(), ApplyError> {
        if Self::read_user(tx, ROOT_USER).is_none() {
            return Err(ApplyError::UserNotFound);
        }
        tx.unsafe_put(Bucket::Auth, ENABLED_KEY, b"true");
        self.bump_revision(tx);
        self.enabled.store(true, Ordering::Release);
        tracing::info!("enabled authentication");
        Ok(())
    }

    pub fn disable(&self, tx: &mut BatchTx<'_>) {
        tx.unsafe_put(Bucket::Auth, ENABLED_KEY, b"false");
        self.bump_revision(tx);
        self.enabled.store(false, Ordering::Release);
        tracing::info!("disabled authentication");
    }

    pub fn user_add(&self, tx: &mut BatchTx<'_>, name: &str, password: &str) -> Result<(), ApplyError> {
        if Self::read_user(tx, name).is_some() {
            return Err(ApplyError::UserAlreadyExist);
        }
        Self::write_user(
            tx,
            &User {
                name: name.to_string(),
                password_hash: hash_password(password),
                roles: Vec::new(),
            },
        );
        self.bump_revision(tx);
        Ok(())
    }

    pub fn user_delete(&self, tx: &mut BatchTx<'_>, name: &str) -> Result<(), ApplyError> {
        if Self::read_user(tx, name).is_none() {
            return Err(ApplyError::UserNotFound);
        }
        tx.unsafe_delete(Bucket::AuthUsers, name.as_bytes());
        self.bump_revision(tx);
        Ok(())
    }

    pub fn user_grant_role(&self, tx: &mut BatchTx<'_>, user: &str, role: &str) -> Result<(), ApplyError> {
        let Some(mut u) = Self::read_user(tx, user) else {
            return Err(ApplyError::UserNotFound);
        };
        if role != ROOT_USER && Self::read_role(tx, role).is_none() {
            return Err(ApplyError::RoleNotFound);
        }
        if !u.roles.contains(&role.to_string()) {
            u.roles.push(role.to_string());
            u.roles.sort();
            Self::write_user(tx, &u);
        }
        self.bump_revision(tx);
        Ok(())
    }

    pub fn role_add(&self, tx: &mut BatchTx<'_>, name: &str) -> Result<(), ApplyError> {
        if Self::read_role(tx, name).is_some() {
            return Err(ApplyError::RoleAlreadyExist);
        }
        Self::write_role(
            tx,
            &Role {
                name: name.to_string(),
                perms: Vec::new(),
            },
        );
        self.bump_revision(tx);
        Ok(())
    }

    pub fn role_delete(&self, tx: &mut BatchTx<'_>, name: &str) -> Result<(), ApplyError> {
        if Self::read_role(tx, name).is_none() {
            return Err(ApplyError::RoleNotFound);
        }
        tx.unsafe_delete(Bucket::AuthRoles, name.as_bytes());

        // Drop the role from every user that carries it.
        let users: Vec<User> = tx
            .unsafe_range(Bucket::AuthUsers, &[], Some(&[0]), 0)
            .into_iter()
            .map(|(_k, v)| serde_json::from_slice(&v).expect("user record is well formed"))
            .collect();
        for mut u in users {
            if u.roles.iter().any(|r| r == name) {
                u.roles.retain(|r| r != name);
                Self::write_user(tx, &u);
            }
        }
        self.bump_revision(tx);
        Ok(())
    }

    pub fn role_grant_permission(
        &self,
        tx: &mut BatchTx<'_>,
        role: &str,
        perm: KeyPermission,
    ) -> Result<(), ApplyError> {
        let Some(mut r) = Self::read_role(tx, role) else {
            return Err(ApplyError::RoleNotFound);
        };
        r.perms.retain(|p| !(p.key == perm.key && p.range_end == perm.range_end));
        r.perms.push(perm);
        Self::write_role(tx, &r);
        self.bump_revision(tx);
        Ok(())
    }

    /// Check that `username` may perform `perm` on `[key, range_end)`.
    ///
    /// A no-op while auth is disabled. Root may do anything.
    pub fn is_op_permitted(
        &self,
        tx: &impl TxReader,
        username: &str,
        key: &[u8],
        range_end: Option<&[u8]>,
        perm: Permission,
    ) -> Result<(), ApplyError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if username.is_empty() {
            return Err(ApplyError::AuthFailed);
        }
        let Some(user) = Self::read_user(tx, username) else {
            return Err(ApplyError::UserNotFound);
        };
        if user.name == ROOT_USER || user.roles.iter().any(|r| r == ROOT_USER) {
            return Ok(());
        }

        for role_name in &user.roles {
            let Some(role) = Self::read_role(tx, role_name) else {
                continue;
            };
            for p in &role.perms {
                if p.perm.allows(perm) && p.covers(key, range_end) {
                    return Ok(());
                }
            }
        }
        Err(ApplyError::PermissionDenied)
    }
}

#[cfg(test)]
mod auth_test;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::auth::AuthStore;
use crate::auth::KeyPermission;
use crate::auth::Permission;
use crate::errors::ApplyError;
use crate::storage::Backend;

fn store() -> (Arc<Backend>, AuthStore) {
    let be = Arc::new(Backend::new());
    let auth = AuthStore::new(be.clone());
    (be, auth)
}

#[test]
fn test_enable_requires_root() -> anyhow::Result<()> {
    let (be, auth) = store();

    {
        let mut tx = be.batch_tx();
        assert_eq!(Err(ApplyError::UserNotFound), auth.enable(&mut tx));
        auth.user_add(&mut tx, "root", "secret")?;
        auth.enable(&mut tx)?;
        tx.commit();
    }
    assert!(auth.is_enabled());

    // The flag survives a restart.
    let fresh = AuthStore::new(be);
    assert!(fresh.is_enabled());
    Ok(())
}

#[test]
fn test_user_and_role_lifecycle() -> anyhow::Result<()> {
    let (be, auth) = store();
    let mut tx = be.batch_tx();

    auth.user_add(&mut tx, "alice", "pw")?;
    assert_eq!(Err(ApplyError::UserAlreadyExist), auth.user_add(&mut tx, "alice", "pw"));

    auth.role_add(&mut tx, "reader")?;
    assert_eq!(Err(ApplyError::RoleAlreadyExist), auth.role_add(&mut tx, "reader"));
    assert_eq!(
        Err(ApplyError::RoleNotFound),
        auth.user_grant_role(&mut tx, "alice", "nope")
    );
    auth.user_grant_role(&mut tx, "alice", "reader")?;

    auth.role_delete(&mut tx, "reader")?;
    assert_eq!(Err(ApplyError::RoleNotFound), auth.role_delete(&mut tx, "reader"));

    auth.user_delete(&mut tx, "alice")?;
    assert_eq!(Err(ApplyError::UserNotFound), auth.user_delete(&mut tx, "alice"));
    tx.commit();
    Ok(())
}

#[test]
fn test_permission_check() -> anyhow::Result<()> {
    let (be, auth) = store();
    let mut tx = be.batch_tx();

    auth.user_add(&mut tx, "root", "pw")?;
    auth.user_add(&mut tx, "alice", "pw")?;
    auth.role_add(&mut tx, "reader")?;
    auth.role_grant_permission(
        &mut tx,
        "reader",
        KeyPermission {
            key: b"app/".to_vec(),
            range_end: Some(b"app0".to_vec()),
            perm: Permission::Read,
        },
    )?;
    auth.user_grant_role(&mut tx, "alice", "reader")?;
    auth.enable(&mut tx)?;

    // Covered read allowed; writes and keys outside the range denied.
    auth.is_op_permitted(&tx, "alice", b"app/x", None, Permission::Read)?;
    assert_eq!(
        Err(ApplyError::PermissionDenied),
        auth.is_op_permitted(&tx, "alice", b"app/x", None, Permission::Write)
    );
    assert_eq!(
        Err(ApplyError::PermissionDenied),
        auth.is_op_permitted(&tx, "alice", b"other", None, Permission::Read)
    );

    // Root bypasses permission checks; unknown and empty users fail.
    auth.is_op_permitted(&tx, "root", b"anything", None, Permission::Write)?;
    assert_eq!(
        Err(ApplyError::UserNotFound),
        auth.is_op_permitted(&tx, "mallory", b"app/x", None, Permission::Read)
    );
    assert_eq!(
        Err(ApplyError::AuthFailed),
        auth.is_op_permitted(&tx, "", b"app/x", None, Permission::Read)
    );
    tx.commit();

    // Disabled auth permits everything.
    let mut tx = be.batch_tx();
    auth.disable(&mut tx);
    tx.commit();
    auth.is_op_permitted(&be.read_tx(), "", b"anything", None, Permission::Write)?;
    Ok(())
}

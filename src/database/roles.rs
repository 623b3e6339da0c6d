//! Roles and their permissions.

use async_trait::async_trait;

use super::Database;
use crate::error::Result;
use crate::store::{PermissionStore, Role, RoleId, UserId};

#[async_trait]
impl PermissionStore for Database {
    async fn find_user_role(&self, user_id: UserId) -> Result<Option<Role>> {
        Ok(sqlx::query_as::<_, Role>(
            r#"SELECT r.id, r.name, r.active FROM users u
            JOIN roles r ON r.id = u.role_id
            WHERE u.id = $1 AND r.active = TRUE"#,
        )
        .bind(user_id)
        .fetch_optional(&self.postgres)
        .await?)
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(
            sqlx::query_as::<_, Role>("SELECT id, name, active FROM roles WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.postgres)
                .await?,
        )
    }

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>> {
        Ok(
            sqlx::query_as::<_, Role>("SELECT id, name, active FROM roles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.postgres)
                .await?,
        )
    }

    async fn role_has_permission(
        &self,
        role_id: RoleId,
        permission: &str,
    ) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (
                SELECT 1 FROM role_permissions rp
                JOIN roles r ON r.id = rp.role_id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE rp.role_id = $1 AND p.name = $2 AND r.active = TRUE
            )"#,
        )
        .bind(role_id)
        .bind(permission)
        .fetch_one(&self.postgres)
        .await?)
    }
}

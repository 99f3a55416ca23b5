pub mod tenant;

pub use tenant::{TenantConn, TenantId, TENANT_ID_HEADER};

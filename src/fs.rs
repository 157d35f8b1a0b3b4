use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::executor::Scope;

#[derive(Error, Debug)]
#[error("QoS already configured in file system [{0}]")]
pub struct AttachError(pub String);

/// The server inventory of one managed filesystem. Discovery happens in the
/// surrounding cluster tooling; the controller only consumes the resolved
/// host lists.
#[derive(Debug)]
pub struct Filesystem {
    fsname: String,
    mgs_host: String,
    oss_hosts: Vec<String>,
    mds_hosts: Vec<String>,
    qos_attached: AtomicBool,
}

impl Filesystem {
    pub fn new(
        fsname: String,
        mgs_host: String,
        oss_hosts: Vec<String>,
        mds_hosts: Vec<String>,
    ) -> Filesystem {
        Filesystem {
            fsname,
            mgs_host,
            oss_hosts,
            mds_hosts,
            qos_attached: AtomicBool::new(false),
        }
    }

    pub fn fsname(&self) -> &str {
        &self.fsname
    }

    pub fn mgs_host(&self) -> &str {
        &self.mgs_host
    }

    pub fn servers(&self, scope: Scope) -> &[String] {
        match scope {
            Scope::Data => &self.oss_hosts,
            Scope::Metadata => &self.mds_hosts,
        }
    }

    /// Claim this filesystem for a QoS controller. At most one controller may
    /// be attached at a time.
    pub fn attach_qos(&self) -> Result<(), AttachError> {
        if self
            .qos_attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AttachError(self.fsname.clone()));
        }
        Ok(())
    }

    /// Release the claim again; called when the attached controller is
    /// dropped so a replacement can attach.
    pub fn detach_qos(&self) {
        self.qos_attached.store(false, Ordering::SeqCst);
    }
}

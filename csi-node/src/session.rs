//! Session manager: iSCSI sessions and the devices they produce.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::connector::ConnectorRecord;
use crate::platform::{Attachment, SessionTools, ToolError};
use crate::types::IscsiTarget;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not connect to {iqn}: {source}")]
    Connect {
        iqn: String,
        #[source]
        source: ToolError,
    },

    #[error("could not resize multipath map {map}: {source}")]
    MultipathResize {
        map: String,
        #[source]
        source: ToolError,
    },

    #[error("could not disconnect from {iqn}: {source}")]
    Disconnect {
        iqn: String,
        #[source]
        source: ToolError,
    },
}

#[derive(Clone)]
pub struct SessionManager {
    tools: Arc<dyn SessionTools>,
}

impl SessionManager {
    pub fn new(tools: Arc<dyn SessionTools>) -> Self {
        Self { tools }
    }

    /// Log in to `target` through all of its portals.
    pub fn connect(&self, target: &IscsiTarget) -> Result<Attachment, SessionError> {
        let portals = target.portals.portal_strings();
        info!(
            target_iqn = %target.iqn,
            portals = ?portals,
            lun = target.lun,
            "Connecting iSCSI session"
        );

        let attachment = self
            .tools
            .login(&target.iqn, &portals, target.lun)
            .map_err(|e| {
                error!(error = %e, target_iqn = %target.iqn, "iSCSI login failed");
                SessionError::Connect {
                    iqn: target.iqn.clone(),
                    source: e,
                }
            })?;

        info!(
            device = %attachment.device_path,
            multipath = attachment.multipath,
            "iSCSI session established"
        );
        Ok(attachment)
    }

    /// The recorded attachment under the host's current device names, or
    /// `None` when the recorded LUN is not present.
    pub fn resolve(&self, record: &ConnectorRecord) -> Option<Attachment> {
        let attachment = self.tools.resolve(record);
        match &attachment {
            Some(a) if a.device_path != record.device_path => info!(
                recorded = %record.device_path,
                device = %a.device_path,
                "Recorded LUN now has a different device name"
            ),
            Some(_) => {}
            None => debug!(
                target_iqn = %record.target_iqn,
                lun = record.lun,
                "Recorded LUN is not present"
            ),
        }
        attachment
    }

    /// Rescan every path of the attachment, then resize the multipath map.
    ///
    /// A failing path rescan is only logged; a failing map resize is fatal.
    pub fn rescan_and_resize(&self, attachment: &Attachment) -> Result<(), SessionError> {
        for device in &attachment.devices {
            if let Err(e) = self.tools.rescan_device(device) {
                warn!(error = %e, device = %device, "Device rescan failed");
            }
        }

        if attachment.multipath
            && let Some(map) = &attachment.multipath_map
        {
            self.tools.resize_multipath(map).map_err(|e| {
                error!(error = %e, map = %map, "Multipath resize failed");
                SessionError::MultipathResize {
                    map: map.clone(),
                    source: e,
                }
            })?;
        }

        debug!(device = %attachment.device_path, "Devices rescanned");
        Ok(())
    }

    /// Tear down the session. A session that is already gone is success.
    pub fn disconnect(&self, record: &ConnectorRecord) -> Result<(), SessionError> {
        match self.tools.logout(record) {
            Ok(()) => {
                info!(target_iqn = %record.target_iqn, "iSCSI session disconnected");
                Ok(())
            }
            Err(ToolError::NoSession(_)) => {
                info!(target_iqn = %record.target_iqn, "iSCSI session already disconnected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, target_iqn = %record.target_iqn, "iSCSI logout failed");
                Err(SessionError::Disconnect {
                    iqn: record.target_iqn.clone(),
                    source: e,
                })
            }
        }
    }
}

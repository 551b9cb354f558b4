//! Smart HTTP services.

use crate::pktline::PktLineWriter;
use crate::{GitError, Result};
use std::fmt;
use std::str::FromStr;

/// The two services a smart HTTP server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl Service {
    /// Name as it appears in URLs and `service=` parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand passed to the backend tool.
    pub fn command(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Returns true if the service modifies the repository.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::ReceivePack)
    }

    /// Content type of the `info/refs` advertisement.
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type a client must send with the POST body.
    pub fn request_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-request",
            Self::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    /// Content type of the POST response.
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl FromStr for Service {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            other => Err(GitError::UnknownService(other.to_string())),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `# service=<name>` pkt-line plus flush that precedes the backend's
/// ref advertisement.
pub fn service_announcement(service: Service) -> Result<Vec<u8>> {
    let mut writer = PktLineWriter::new(Vec::new());
    writer.write_line(&format!("# service={}", service.as_str()))?;
    writer.flush_pkt()?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_services() {
        assert_eq!("git-upload-pack".parse::<Service>().unwrap(), Service::UploadPack);
        assert_eq!("git-receive-pack".parse::<Service>().unwrap(), Service::ReceivePack);
        assert!(matches!(
            "git-archive".parse::<Service>(),
            Err(GitError::UnknownService(_))
        ));
    }

    #[test]
    fn content_types_follow_service_name() {
        for service in [Service::UploadPack, Service::ReceivePack] {
            let name = service.as_str();
            assert_eq!(
                service.advertisement_content_type(),
                format!("application/x-{name}-advertisement")
            );
            assert_eq!(
                service.request_content_type(),
                format!("application/x-{name}-request")
            );
            assert_eq!(
                service.result_content_type(),
                format!("application/x-{name}-result")
            );
            assert_eq!(format!("git-{}", service.command()), name);
        }
    }

    #[test]
    fn announcement_is_framed() {
        assert_eq!(
            service_announcement(Service::UploadPack).unwrap(),
            b"001e# service=git-upload-pack\n0000"
        );
        assert_eq!(
            service_announcement(Service::ReceivePack).unwrap(),
            b"001f# service=git-receive-pack\n0000"
        );
    }
}

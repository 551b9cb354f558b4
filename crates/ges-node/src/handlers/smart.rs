//! Smart HTTP protocol: ref advertisement and the two RPC services.
//!
//! Both endpoints run the backend tool in stateless-RPC mode and stream its
//! stdout straight to the client. The response status is decided only after
//! the first chunk of output (or the exit status, if there is none), so a
//! backend that fails up front still yields a proper 502 with its stderr.
//! Once output has started, a later failure can only end the body early.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use ges_git::{service_announcement, Service};
use ges_pipe::{ExitReport, PipeCommand, Spool, SpoolReader, StdinSource, Subprocess};
use ges_repo::RepositoryDescriptor;
use std::path::Path;
use tracing::{debug, info, warn};

use super::upload::{BodyPump, CHUNK_SIZE};
use super::{blocking, RouteParams};
use crate::cache::CacheControl;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::server::Gateway;
use crate::watchdog::spawn_idle_watchdog;

/// `GET .../info/refs?service=...`
pub async fn advertise_refs(
    gateway: &Gateway,
    params: &RouteParams,
    service: Service,
) -> Result<Response> {
    let repo = open_repository(gateway, params.repo(), service).await?;
    debug!(repo = %params.repo(), service = %service, "Advertising refs");

    let command = backend_command(gateway.config(), service, &repo.root_path, true);
    let child = Subprocess::spawn(command, StdinSource::Null)?;
    let announcement = Bytes::from(service_announcement(service)?);

    stream_response(
        gateway,
        child,
        service.advertisement_content_type(),
        announcement,
        None,
    )
    .await
}

/// `POST .../git-upload-pack` and `POST .../git-receive-pack`.
pub async fn service_rpc(
    gateway: &Gateway,
    params: &RouteParams,
    request: Request,
) -> Result<Response> {
    let service: Service = params.capture("service").unwrap_or_default().parse()?;
    check_content_type(request.headers(), service)?;
    let gzip = is_gzip(request.headers());

    let repo = open_repository(gateway, params.repo(), service).await?;
    debug!(repo = %params.repo(), service = %service, gzip, "Running service");

    // The body is buffered through a spool so the client upload never
    // waits on the backend reading stdin.
    let (writer, reader) = Spool::channel(gateway.config().spool_config());
    let pump = BodyPump::spawn(request.into_body().into_data_stream(), writer, gzip);
    let intake = pump.error();

    let command = backend_command(gateway.config(), service, &repo.root_path, false);
    let child = Subprocess::spawn(command, StdinSource::Spool(reader))?;

    // The pump travels with the response body. A failed response drops it,
    // which stops the upload copy.
    let result = stream_response(
        gateway,
        child,
        service.result_content_type(),
        Bytes::new(),
        Some(pump),
    )
    .await;
    // A body we could not decode is the real cause of the backend failing.
    result.map_err(|err| intake.take().unwrap_or(err))
}

/// Opens the repository, creating it first for a push when allowed.
async fn open_repository(
    gateway: &Gateway,
    working_path: &str,
    service: Service,
) -> Result<RepositoryDescriptor> {
    let create = service.is_write() && gateway.config().auto_create_on_push;
    let locator = gateway.locator().clone();
    let path = working_path.to_string();

    let (descriptor, created) = blocking(move || locator.open_or_create(&path, create)).await?;
    if created {
        info!(repo = %working_path, "Created repository for push");
    }
    Ok(descriptor)
}

fn backend_command(
    config: &GatewayConfig,
    service: Service,
    repo: &Path,
    advertise: bool,
) -> PipeCommand {
    let mut command = PipeCommand::new(&config.backend_tool_path)
        .arg(service.command())
        .arg("--stateless-rpc");
    if advertise {
        command = command.arg("--advertise-refs");
    }
    command
        .arg(repo)
        .current_dir(repo)
        .spool(config.spool_config())
        .timeout(config.backend_timeout())
}

fn check_content_type(headers: &HeaderMap, service: Service) -> Result<()> {
    let expected = service.request_content_type();
    let actual = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim);
    match actual {
        Some(actual) if actual.eq_ignore_ascii_case(expected) => Ok(()),
        _ => Err(GatewayError::UnsupportedMediaType { expected }),
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
}

/// Waits for the first output and turns the child into a streaming
/// response with `prefix` in front.
async fn stream_response(
    gateway: &Gateway,
    mut child: Subprocess,
    content_type: &'static str,
    prefix: Bytes,
    pump: Option<BodyPump>,
) -> Result<Response> {
    if let Some(limit) = gateway.config().backend_idle_timeout() {
        spawn_idle_watchdog(child.idle_probe(), child.canceller(), limit);
    }

    let mut stdout = child
        .take_stdout()
        .ok_or_else(|| GatewayError::Internal("backend stdout unavailable".to_string()))?;
    let mut buf = vec![0u8; CHUNK_SIZE];

    let first = stdout.read(&mut buf).await;
    let body = match first {
        Ok(n) if n > 0 => {
            let mut head = BytesMut::with_capacity(prefix.len() + n);
            head.extend_from_slice(&prefix);
            head.extend_from_slice(&buf[..n]);

            let state = BackendOutput {
                stdout,
                child: Some(child),
                buf,
                _pump: pump,
            };
            let tail = futures::stream::try_unfold(state, next_chunk);
            let head = futures::stream::once(async move { Ok::<_, GatewayError>(head.freeze()) });
            Body::from_stream(head.chain(tail))
        }
        other => {
            // Nothing on stdout: the exit status decides.
            let report = child.wait().await?;
            log_exit(child.program(), &report);
            report.into_result()?;
            other?;
            Body::from(prefix)
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    CacheControl::NoCache.apply(headers);
    Ok(response)
}

/// State of a response body that is still streaming from the backend.
/// Dropping it (client gone) drops the [`Subprocess`], which kills the
/// child, and the request body pump, which stops the upload copy.
struct BackendOutput {
    stdout: SpoolReader,
    child: Option<Subprocess>,
    buf: Vec<u8>,
    _pump: Option<BodyPump>,
}

async fn next_chunk(mut state: BackendOutput) -> Result<Option<(Bytes, BackendOutput)>> {
    let n = state.stdout.read(&mut state.buf).await?;
    if n > 0 {
        let chunk = Bytes::copy_from_slice(&state.buf[..n]);
        return Ok(Some((chunk, state)));
    }

    if let Some(mut child) = state.child.take() {
        let report = child.wait().await?;
        log_exit(child.program(), &report);
        if let Err(err) = report.into_result() {
            warn!(error = %err, "Backend failed after the response started");
            return Err(err.into());
        }
    }
    Ok(None)
}

/// Emits captured stderr: `warn` for failures, `debug` otherwise.
fn log_exit(program: &str, report: &ExitReport) {
    let success = report.outcome.success();
    for line in report.stderr.lines().filter(|l| !l.trim().is_empty()) {
        if success {
            debug!(backend = program, "{line}");
        } else {
            warn!(backend = program, "{line}");
        }
    }
    if success {
        debug!(backend = program, "Backend finished");
    } else {
        warn!(backend = program, outcome = ?report.outcome, "Backend failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn content_type_must_match_service() {
        let ok = headers(&[(
            header::CONTENT_TYPE,
            "application/x-git-upload-pack-request",
        )]);
        assert!(check_content_type(&ok, Service::UploadPack).is_ok());
        assert!(matches!(
            check_content_type(&ok, Service::ReceivePack),
            Err(GatewayError::UnsupportedMediaType { .. })
        ));
        assert!(check_content_type(&HeaderMap::new(), Service::UploadPack).is_err());

        let with_params = headers(&[(
            header::CONTENT_TYPE,
            "application/x-git-receive-pack-request; charset=binary",
        )]);
        assert!(check_content_type(&with_params, Service::ReceivePack).is_ok());
    }

    #[test]
    fn detects_gzip() {
        assert!(is_gzip(&headers(&[(header::CONTENT_ENCODING, "gzip")])));
        assert!(is_gzip(&headers(&[(header::CONTENT_ENCODING, "x-gzip")])));
        assert!(!is_gzip(&headers(&[(header::CONTENT_ENCODING, "br")])));
        assert!(!is_gzip(&HeaderMap::new()));
    }

    #[test]
    fn command_line() {
        let config = GatewayConfig {
            backend_tool_path: "/usr/bin/git".into(),
            ..GatewayConfig::default()
        };
        let command = backend_command(&config, Service::ReceivePack, Path::new("/srv/r.git"), true);
        let debug = format!("{command:?}");
        assert!(debug.contains("receive-pack"));
        assert!(debug.contains("--stateless-rpc"));
        assert!(debug.contains("--advertise-refs"));
        assert_eq!(command.program(), "/usr/bin/git");
    }
}

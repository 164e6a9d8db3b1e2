//! REST adapter over the analysis core.
//!
//! Every route marshals a request, calls one operation on
//! [`AnalysisContext`] and maps the result onto a status code; no logic
//! lives here. The core's operations are synchronous (the document store
//! blocks), so each handler body runs under `spawn_blocking` to keep the
//! async executor clean. Routes are composed per resource group and boxed
//! so the filter types stay manageable.

use std::net::IpAddr;
use std::sync::Arc;

use log::info;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{reply, Filter, Rejection, Reply};

use crate::configuration::types::{CaptureOptions, SshConfig};
use crate::connections::pcap_export::export_connection_pcap;
use crate::connections::types::{ConnectionsFilter, MessageFormat};
use crate::controller::AnalysisContext;
use crate::error_handling::types::{SearchError, SessionError};
use crate::rules::types::Rule;
use crate::search::SearchOptions;
use crate::services::Service;
use crate::statistics::StatisticsFilter;
use crate::storage::types::RowId;
use crate::web_interface::types::{
    ApiError, CommentRequest, FormatQuery, ImportRequest, IntervalRequest, RemoteCaptureRequest,
};

type Response = warp::reply::Response;

pub struct WebServer {
    context: Arc<AnalysisContext>,
}

impl WebServer {
    pub fn new(context: Arc<AnalysisContext>) -> Self {
        Self { context }
    }

    /// Serve the API until the task is aborted.
    pub async fn serve(&self, bind: (IpAddr, u16)) {
        info!("web interface listening on {}:{}", bind.0, bind.1);
        warp::serve(self.router()).run(bind).await;
    }

    /// The full route tree; public for in-process tests.
    pub fn router(&self) -> BoxedFilter<(Response,)> {
        let api = status_routes(self.context.clone())
            .or(rule_routes(self.context.clone()))
            .unify()
            .or(capture_routes(self.context.clone()))
            .unify()
            .or(session_routes(self.context.clone()))
            .unify()
            .or(connection_routes(self.context.clone()))
            .unify()
            .or(stream_routes(self.context.clone()))
            .unify()
            .or(search_routes(self.context.clone()))
            .unify()
            .or(service_routes(self.context.clone()))
            .unify()
            .or(statistics_routes(self.context.clone()))
            .unify();
        warp::path("api").and(api).boxed()
    }
}

fn with_context(
    context: Arc<AnalysisContext>,
) -> impl Filter<Extract = (Arc<AnalysisContext>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || context.clone())
}

/// Run a synchronous handler body off the async executor.
async fn blocking<F>(body: F) -> Result<Response, Rejection>
where
    F: FnOnce() -> Response + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(body).await.unwrap_or_else(|_| {
        error(StatusCode::INTERNAL_SERVER_ERROR, "handler panicked")
    }))
}

fn ok<T: Serialize>(value: &T) -> Response {
    reply::with_status(reply::json(value), StatusCode::OK).into_response()
}

fn accepted<T: Serialize>(value: &T) -> Response {
    reply::with_status(reply::json(value), StatusCode::ACCEPTED).into_response()
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    reply::with_status(reply::json(&ApiError::new(message)), status).into_response()
}

fn not_found(what: &str) -> Response {
    error(StatusCode::NOT_FOUND, format!("{} not found", what))
}

fn bad_id() -> Response {
    error(StatusCode::BAD_REQUEST, "malformed id")
}

fn storage_error(err: impl std::fmt::Display) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn session_error(err: SessionError) -> Response {
    match err {
        SessionError::NotFound => not_found("session"),
        SessionError::DuplicatePcap => error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        SessionError::CaptureAlreadyRunning | SessionError::NoCaptureRunning => {
            error(StatusCode::BAD_REQUEST, err.to_string())
        }
        other => error(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

fn pcap_attachment(bytes: Vec<u8>) -> Response {
    reply::with_header(bytes, "Content-Type", "application/vnd.tcpdump.pcap").into_response()
}

// ── status ──

fn status_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    warp::path!("status")
        .and(warp::get())
        .and(with_context(context))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || {
                ok(&json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "rules": context.rules.get_rules().len(),
                    "sessions": context.importer.get_sessions().len(),
                    "live_capture": context.capture.current_source(),
                }))
            })
        })
        .boxed()
}

// ── rules ──

fn rule_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let list = warp::path!("rules")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || ok(&context.rules.get_rules()))
        });

    let create = warp::path!("rules")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|rule: Rule, context: Arc<AnalysisContext>| {
            blocking(move || match context.rules.add_rule(rule) {
                Ok(id) => ok(&json!({"id": id})),
                Err(err) => error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            })
        });

    let get = warp::path!("rules" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || match Uuid::parse_str(&id) {
                Err(_) => bad_id(),
                Ok(id) => match context.rules.get_rule(id) {
                    Some(rule) => ok(&rule),
                    None => not_found("rule"),
                },
            })
        });

    let update = warp::path!("rules" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context))
        .and_then(|id: String, rule: Rule, context: Arc<AnalysisContext>| {
            blocking(move || match Uuid::parse_str(&id) {
                Err(_) => bad_id(),
                Ok(id) => match context.rules.update_rule(id, rule) {
                    Ok(true) => ok(&json!({"id": id})),
                    Ok(false) => not_found("rule"),
                    Err(err) => error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
                },
            })
        });

    list.or(create).unify().or(get).unify().or(update).unify().boxed()
}

// ── capture & import ──

fn capture_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let import = warp::path!("pcap" / "file")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|request: ImportRequest, context: Arc<AnalysisContext>| {
            blocking(
                move || match context.importer.import_file(&request.file, request.flush_all) {
                    Ok(session) => {
                        if request.delete_original_file {
                            let _ = std::fs::remove_file(&request.file);
                        }
                        accepted(&json!({"session": session}))
                    }
                    Err(err) => session_error(err),
                },
            )
        });

    let start_local = warp::path!("capture" / "local")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|options: CaptureOptions, context: Arc<AnalysisContext>| {
            blocking(move || match context.capture.start_local_capture(&options) {
                Ok(()) => ok(&json!({"capture": "local"})),
                Err(err) => session_error(err),
            })
        });

    let start_remote = warp::path!("capture" / "remote")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|request: RemoteCaptureRequest, context: Arc<AnalysisContext>| {
            blocking(move || {
                match context
                    .capture
                    .start_remote_capture(&request.ssh_config, &request.capture_options)
                {
                    Ok(()) => ok(&json!({"capture": "remote"})),
                    Err(err) => session_error(err),
                }
            })
        });

    let stop = warp::path!("capture")
        .and(warp::delete())
        .and(with_context(context.clone()))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || match context.capture.stop_capture() {
                Ok(()) => ok(&json!({"capture": "stop"})),
                Err(err) => session_error(err),
            })
        });

    let interval = warp::path!("capture" / "interval")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|request: IntervalRequest, context: Arc<AnalysisContext>| {
            blocking(move || {
                context
                    .capture
                    .set_rotation_interval(std::time::Duration::from_secs(
                        request.rotation_interval_secs,
                    ));
                ok(&json!({"result": "ok"}))
            })
        });

    let local_interfaces = warp::path!("capture" / "local" / "interfaces")
        .and(warp::post())
        .and_then(|| {
            blocking(move || match crate::capture::list_interfaces() {
                Ok(interfaces) => ok(&interfaces),
                Err(err) => error(StatusCode::BAD_REQUEST, err.to_string()),
            })
        });

    let remote_interfaces = warp::path!("capture" / "remote" / "interfaces")
        .and(warp::post())
        .and(warp::body::json())
        .and_then(|ssh: SshConfig| {
            blocking(move || match crate::capture::list_remote_interfaces(&ssh) {
                Ok(interfaces) => ok(&interfaces),
                Err(err) => error(StatusCode::BAD_REQUEST, err.to_string()),
            })
        });

    import
        .or(start_local)
        .unify()
        .or(start_remote)
        .unify()
        .or(stop)
        .unify()
        .or(interval)
        .unify()
        .or(local_interfaces)
        .unify()
        .or(remote_interfaces)
        .unify()
        .boxed()
}

// ── sessions ──

fn session_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let list = warp::path!("pcap" / "sessions")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || ok(&context.importer.get_sessions()))
        });

    let get = warp::path!("pcap" / "sessions" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || match RowId::from_hex(&id) {
                None => bad_id(),
                Some(id) => match context.importer.get_session(id) {
                    Some(session) => ok(&session),
                    None => not_found("session"),
                },
            })
        });

    let cancel = warp::path!("pcap" / "sessions" / String)
        .and(warp::delete())
        .and(with_context(context.clone()))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || match RowId::from_hex(&id) {
                None => bad_id(),
                Some(id) => {
                    if context.importer.cancel_session(id) {
                        accepted(&json!({"session": id}))
                    } else {
                        not_found("session")
                    }
                }
            })
        });

    let download = warp::path!("pcap" / "sessions" / String / "download")
        .and(warp::get())
        .and(with_context(context))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || match RowId::from_hex(&id) {
                None => bad_id(),
                Some(id) => {
                    let path = context.config.pcaps_dir().join(format!("{}.pcap", id));
                    match std::fs::read(&path) {
                        Ok(bytes) => pcap_attachment(bytes),
                        Err(_) => not_found("session pcap"),
                    }
                }
            })
        });

    list.or(get).unify().or(cancel).unify().or(download).unify().boxed()
}

// ── connections ──

fn connection_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let list = warp::path!("connections")
        .and(warp::get())
        .and(warp::query::<ConnectionsFilter>())
        .and(with_context(context.clone()))
        .and_then(|filter: ConnectionsFilter, context: Arc<AnalysisContext>| {
            blocking(move || match context.connections.get_connections(&filter) {
                Ok(connections) => ok(&connections),
                Err(err) => storage_error(err),
            })
        });

    let get = warp::path!("connections" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || match RowId::from_hex(&id) {
                None => bad_id(),
                Some(id) => match context.connections.get_connection(id) {
                    Ok(Some(connection)) => ok(&connection),
                    Ok(None) => not_found("connection"),
                    Err(err) => storage_error(err),
                },
            })
        });

    // only the comment action carries a body; the others post empty
    let action = warp::path!("connections" / String / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_context(context.clone()))
        .and_then(
            |id: String,
             action: String,
             raw: warp::hyper::body::Bytes,
             context: Arc<AnalysisContext>| {
                blocking(move || {
                    let body: CommentRequest = serde_json::from_slice(&raw).unwrap_or_default();
                    let id = match RowId::from_hex(&id) {
                        None => return bad_id(),
                        Some(id) => id,
                    };
                    let result = match action.as_str() {
                        "hide" => context.connections.set_hidden(id, true),
                        "show" => context.connections.set_hidden(id, false),
                        "mark" => context.connections.set_marked(id, true),
                        "unmark" => context.connections.set_marked(id, false),
                        "comment" => context.connections.set_comment(id, &body.comment),
                        _ => return error(StatusCode::BAD_REQUEST, "invalid action"),
                    };
                    match result {
                        Ok(true) => ok(&json!({"connection_id": id, "action": action})),
                        Ok(false) => not_found("connection"),
                        Err(err) => storage_error(err),
                    }
                })
            },
        );

    let download_pcap = warp::path!("pcap" / "connections" / String / "download")
        .and(warp::get())
        .and(with_context(context))
        .and_then(|id: String, context: Arc<AnalysisContext>| {
            blocking(move || {
                let id = match RowId::from_hex(&id) {
                    None => return bad_id(),
                    Some(id) => id,
                };
                match context.connections.get_connection(id) {
                    Ok(Some(connection)) => {
                        let exported = export_connection_pcap(
                            &connection,
                            &context.config.pcaps_dir(),
                            &context.config.connections_dir(),
                        );
                        match exported.and_then(|path| std::fs::read(path).map_err(Into::into)) {
                            Ok(bytes) => pcap_attachment(bytes),
                            Err(err) => error(StatusCode::NOT_FOUND, err.to_string()),
                        }
                    }
                    Ok(None) => not_found("connection"),
                    Err(err) => storage_error(err),
                }
            })
        });

    list.or(get)
        .unify()
        .or(action)
        .unify()
        .or(download_pcap)
        .unify()
        .boxed()
}

// ── streams ──

fn stream_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let get = warp::path!("streams" / String)
        .and(warp::get())
        .and(warp::query::<FormatQuery>())
        .and(with_context(context.clone()))
        .and_then(|id: String, query: FormatQuery, context: Arc<AnalysisContext>| {
            blocking(move || {
                let format = query.format.unwrap_or_default();
                match RowId::from_hex(&id) {
                    None => bad_id(),
                    Some(id) => match context.streams.get_messages(id, format) {
                        Ok(Some(messages)) => ok(&messages),
                        Ok(None) => not_found("connection"),
                        Err(err) => storage_error(err),
                    },
                }
            })
        });

    let download = warp::path!("streams" / String / "download")
        .and(warp::get())
        .and(warp::query::<FormatQuery>())
        .and(with_context(context))
        .and_then(|id: String, query: FormatQuery, context: Arc<AnalysisContext>| {
            blocking(move || {
                let format = query.format.unwrap_or(MessageFormat::Raw);
                if format == MessageFormat::Printable {
                    return error(StatusCode::BAD_REQUEST, "'printable' is a query-only format");
                }
                match RowId::from_hex(&id) {
                    None => bad_id(),
                    Some(id) => match context.streams.download_messages(id, format) {
                        Ok(Some(blob)) => {
                            reply::with_header(blob, "Content-Type", "application/octet-stream")
                                .into_response()
                        }
                        Ok(None) => not_found("connection"),
                        Err(err) => storage_error(err),
                    },
                }
            })
        });

    get.or(download).unify().boxed()
}

// ── search ──

fn search_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let history = warp::path!("searches")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || match context.search.get_performed_searches() {
                Ok(searches) => ok(&searches),
                Err(err) => storage_error(err),
            })
        });

    let perform = warp::path!("searches" / "perform")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context))
        .and_then(|options: SearchOptions, context: Arc<AnalysisContext>| {
            blocking(move || match context.search.perform_search(options) {
                Ok(performed) => ok(&performed),
                Err(err @ SearchError::InvalidOptions(_)) => {
                    error(StatusCode::BAD_REQUEST, err.to_string())
                }
                Err(err) => storage_error(err),
            })
        });

    history.or(perform).unify().boxed()
}

// ── services ──

fn service_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let list = warp::path!("services")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(|context: Arc<AnalysisContext>| {
            blocking(move || match context.services.get_services() {
                Ok(services) => ok(&services),
                Err(err) => storage_error(err),
            })
        });

    let set = warp::path!("services")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(|service: Service, context: Arc<AnalysisContext>| {
            blocking(move || match context.services.set_service(service.clone()) {
                Ok(()) => ok(&service),
                Err(err) => error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            })
        });

    let delete = warp::path!("services")
        .and(warp::delete())
        .and(warp::body::json())
        .and(with_context(context))
        .and_then(|service: Service, context: Arc<AnalysisContext>| {
            blocking(move || match context.services.delete_service(service.port) {
                Ok(true) => ok(&json!({"port": service.port})),
                Ok(false) => not_found("service"),
                Err(err) => storage_error(err),
            })
        });

    list.or(set).unify().or(delete).unify().boxed()
}

// ── statistics ──

fn statistics_routes(context: Arc<AnalysisContext>) -> BoxedFilter<(Response,)> {
    let buckets = warp::path!("statistics")
        .and(warp::get())
        .and(warp::query::<StatisticsFilter>())
        .and(with_context(context.clone()))
        .and_then(|filter: StatisticsFilter, context: Arc<AnalysisContext>| {
            blocking(move || match context.statistics.get_statistics(&filter) {
                Ok(buckets) => ok(&buckets),
                Err(err) => storage_error(err),
            })
        });

    let totals = warp::path!("statistics" / "totals")
        .and(warp::get())
        .and(warp::query::<StatisticsFilter>())
        .and(with_context(context))
        .and_then(|filter: StatisticsFilter, context: Arc<AnalysisContext>| {
            blocking(move || match context.statistics.get_total_statistics(&filter) {
                Ok(totals) => ok(&totals),
                Err(err) => storage_error(err),
            })
        });

    buckets.or(totals).unify().boxed()
}

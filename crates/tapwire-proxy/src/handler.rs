//! Message handlers and the driver that runs them.

use std::io::Read;
use std::sync::Arc;

use anyhow::Context as _;
use flate2::read::{GzDecoder, ZlibDecoder};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::ServerConfig;
use crate::message::{HttpMessage, HttpRequest};

/// Lock serialising the request phase of every non-excluded message in the
/// process when serialise mode is on.
static SERIALISE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Per-message state shared with handlers.
///
/// One context lives per connection; it is reset when the request phase of
/// each message starts.
#[derive(Debug)]
pub struct HandlerContext {
    recursive: bool,
    from_client: bool,
    excluded: bool,
    overridden: bool,
    close: bool,
}

impl Default for HandlerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerContext {
    /// Creates a context ready for a first request.
    pub fn new() -> Self {
        Self {
            recursive: false,
            from_client: true,
            excluded: false,
            overridden: false,
            close: false,
        }
    }

    /// Whether the current request is addressed to the proxy itself.
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// `true` in the request phase, `false` in the response phase.
    pub fn is_from_client(&self) -> bool {
        self.from_client
    }

    /// Whether the message matched an exclusion pattern.
    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// Whether a handler took over the message.
    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    /// Whether a handler asked for the connection to be dropped.
    pub fn should_close(&self) -> bool {
        self.close
    }

    /// Stops iteration; the message is still written to the client.
    pub fn set_overridden(&mut self) {
        self.overridden = true;
    }

    /// Stops iteration and closes the connection without writing.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    fn reset_for_request(&mut self, recursive: bool, excluded: bool) {
        self.recursive = recursive;
        self.from_client = true;
        self.excluded = excluded;
        self.overridden = false;
        self.close = false;
    }

    fn begin_response_phase(&mut self) {
        self.from_client = false;
        self.overridden = false;
        self.close = false;
    }

    fn set_recursive(&mut self, recursive: bool) {
        self.recursive = recursive;
    }
}

/// A hook invoked for each message, once with the request and once with the
/// response.
///
/// Returning an error logs it and moves on to the next handler; flags set on
/// the context before the error still apply.
pub trait MessageHandler: Send + Sync {
    /// Inspects or mutates the in-flight message.
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        msg: &mut HttpMessage,
    ) -> anyhow::Result<()>;
}

/// What the pipeline should do with the message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Write the response, then apply the usual close rules.
    Write,
    /// Drop the connection without writing.
    Close,
}

/// Drives an ordered handler list through the request and response phases of
/// one message at a time.
pub struct MainHandler {
    handlers: Vec<Arc<dyn MessageHandler>>,
    local_lock: Mutex<()>,
}

enum PhaseOutcome {
    Completed,
    Overridden,
    Close,
}

impl MainHandler {
    /// Creates a driver over the given handlers. Order is invocation order.
    pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        Self {
            handlers,
            local_lock: Mutex::new(()),
        }
    }

    /// Processes one message.
    ///
    /// The request phase runs every handler in order; `close` stops
    /// everything, `overridden` skips both the remaining handlers and the
    /// response phase (the message is written as-is). Otherwise the response
    /// phase runs the same list again. `is_recursive` is re-evaluated
    /// against the current request before each handler since handlers may
    /// rewrite it.
    pub fn process(
        &self,
        config: &ServerConfig,
        is_recursive: &dyn Fn(&HttpRequest) -> bool,
        ctx: &mut HandlerContext,
        msg: &mut HttpMessage,
    ) -> ProcessOutcome {
        let excluded = config.is_excluded(&msg.request.normalized_uri());
        ctx.reset_for_request(is_recursive(&msg.request), excluded);

        let request_outcome = {
            // Serialise mode funnels non-excluded requests through one
            // process-wide lock; excluded ones only contend with this
            // handler's own messages.
            let _guard: MutexGuard<'_, ()> = if config.serialise() && !excluded {
                SERIALISE_LOCK.lock()
            } else {
                self.local_lock.lock()
            };
            self.run_phase(is_recursive, ctx, msg)
        };
        match request_outcome {
            PhaseOutcome::Close => return ProcessOutcome::Close,
            PhaseOutcome::Overridden => return ProcessOutcome::Write,
            PhaseOutcome::Completed => {}
        }

        ctx.begin_response_phase();
        match self.run_phase(is_recursive, ctx, msg) {
            PhaseOutcome::Close => ProcessOutcome::Close,
            _ => ProcessOutcome::Write,
        }
    }

    fn run_phase(
        &self,
        is_recursive: &dyn Fn(&HttpRequest) -> bool,
        ctx: &mut HandlerContext,
        msg: &mut HttpMessage,
    ) -> PhaseOutcome {
        for handler in &self.handlers {
            ctx.set_recursive(is_recursive(&msg.request));
            if let Err(error) = handler.handle_message(ctx, msg) {
                warn!(error = %format!("{error:#}"), "message handler failed");
            }
            if ctx.should_close() {
                return PhaseOutcome::Close;
            }
            if ctx.is_overridden() {
                return PhaseOutcome::Overridden;
            }
        }
        PhaseOutcome::Completed
    }
}

/// Strips `Accept-Encoding` from non-excluded client requests so upstream
/// servers answer with bodies the proxy can inspect.
#[derive(Debug, Default)]
pub struct RemoveAcceptEncodingHandler;

impl MessageHandler for RemoveAcceptEncodingHandler {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        msg: &mut HttpMessage,
    ) -> anyhow::Result<()> {
        if ctx.is_from_client() && !ctx.is_excluded() {
            msg.request.headers.remove("Accept-Encoding");
        }
        Ok(())
    }
}

/// Inflates gzip/deflate response bodies, fixing up `Content-Encoding` and
/// `Content-Length` to match.
#[derive(Debug, Default)]
pub struct DecodeResponseHandler;

impl MessageHandler for DecodeResponseHandler {
    fn handle_message(
        &self,
        ctx: &mut HandlerContext,
        msg: &mut HttpMessage,
    ) -> anyhow::Result<()> {
        if ctx.is_from_client() || msg.response.body.is_empty() {
            return Ok(());
        }
        let encoding = match msg.response.headers.get("Content-Encoding") {
            Some(value) => value.trim().to_ascii_lowercase(),
            None => return Ok(()),
        };
        let mut decoded = Vec::new();
        match encoding.as_str() {
            "gzip" | "x-gzip" => GzDecoder::new(&msg.response.body[..])
                .read_to_end(&mut decoded)
                .context("gzip decode failed")?,
            "deflate" => ZlibDecoder::new(&msg.response.body[..])
                .read_to_end(&mut decoded)
                .context("deflate decode failed")?,
            _ => return Ok(()),
        };
        msg.response.body = decoded;
        msg.response.headers.remove("Content-Encoding");
        msg.response
            .headers
            .set("Content-Length", msg.response.body.len().to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use regex::Regex;

    use super::*;
    use crate::message::HttpResponse;

    struct FnHandler<F>(F);

    impl<F> MessageHandler for FnHandler<F>
    where
        F: Fn(&mut HandlerContext, &mut HttpMessage) -> anyhow::Result<()> + Send + Sync,
    {
        fn handle_message(
            &self,
            ctx: &mut HandlerContext,
            msg: &mut HttpMessage,
        ) -> anyhow::Result<()> {
            (self.0)(ctx, msg)
        }
    }

    fn handler<F>(f: F) -> Arc<dyn MessageHandler>
    where
        F: Fn(&mut HandlerContext, &mut HttpMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(FnHandler(f))
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn message() -> HttpMessage {
        let mut request = HttpRequest::new("GET", "http://example.org/");
        request.headers.push("Host", "example.org");
        HttpMessage::new(request)
    }

    fn not_recursive(_: &HttpRequest) -> bool {
        false
    }

    #[test]
    fn notifies_all_handlers_for_request_and_response() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![counting(first.clone()), counting(second.clone())]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Write);
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn request_phase_runs_before_response_phase() {
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = phases.clone();
        let main = MainHandler::new(vec![handler(move |ctx, _| {
            seen.lock().push(ctx.is_from_client());
            Ok(())
        })]);

        main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(*phases.lock(), vec![true, false]);
    }

    #[test]
    fn overridden_request_skips_remaining_handlers_and_response_phase() {
        let late = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![
            handler(|ctx, _| {
                if ctx.is_from_client() {
                    ctx.set_overridden();
                }
                Ok(())
            }),
            counting(late.clone()),
        ]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Write);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overridden_response_stops_iteration_but_still_writes() {
        let late = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![
            handler(|ctx, _| {
                if !ctx.is_from_client() {
                    ctx.set_overridden();
                }
                Ok(())
            }),
            counting(late.clone()),
        ]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Write);
        // Second handler sees the request phase only.
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_during_request_drops_connection_without_response_phase() {
        let late = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![
            handler(|ctx, _| {
                ctx.set_close();
                Ok(())
            }),
            counting(late.clone()),
        ]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Close);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_during_response_drops_connection() {
        let main = MainHandler::new(vec![handler(|ctx, _| {
            if !ctx.is_from_client() {
                ctx.set_close();
            }
            Ok(())
        })]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Close);
    }

    #[test]
    fn handler_error_is_skipped_and_following_handlers_run() {
        let late = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![
            handler(|_, _| anyhow::bail!("boom")),
            counting(late.clone()),
        ]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Write);
        assert_eq!(late.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flags_set_before_handler_error_still_apply() {
        let late = Arc::new(AtomicUsize::new(0));
        let main = MainHandler::new(vec![
            handler(|ctx, _| {
                ctx.set_close();
                anyhow::bail!("boom")
            }),
            counting(late.clone()),
        ]);

        let outcome = main.process(
            &ServerConfig::default(),
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(outcome, ProcessOutcome::Close);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_resets_between_messages() {
        let main = MainHandler::new(vec![handler(|ctx, _| {
            if ctx.is_from_client() {
                ctx.set_overridden();
            }
            Ok(())
        })]);
        let config = ServerConfig::default();
        let mut ctx = HandlerContext::new();

        assert_eq!(
            main.process(&config, &not_recursive, &mut ctx, &mut message()),
            ProcessOutcome::Write
        );
        // A fresh message must not inherit the previous overridden flag.
        let seen_overridden = Arc::new(AtomicUsize::new(0));
        let seen = seen_overridden.clone();
        let checking = MainHandler::new(vec![handler(move |ctx, _| {
            if ctx.is_overridden() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })]);
        checking.process(&config, &not_recursive, &mut ctx, &mut message());
        assert_eq!(seen_overridden.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recursive_flag_recomputed_after_request_rewrite() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = observed.clone();
        let main = MainHandler::new(vec![
            handler(|_, msg| {
                msg.request.uri = "http://localhost:8080/".to_string();
                Ok(())
            }),
            handler(move |ctx, _| {
                seen.lock().push(ctx.is_recursive());
                Ok(())
            }),
        ]);

        let is_recursive =
            |request: &HttpRequest| request.uri.starts_with("http://localhost:8080/");
        main.process(
            &ServerConfig::default(),
            &is_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(*observed.lock(), vec![true, true]);
    }

    #[test]
    fn excluded_flag_comes_from_configured_patterns() {
        let config = ServerConfig::default()
            .with_session_exclusions(vec![Regex::new(r"example\.org").unwrap()]);
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = observed.clone();
        let main = MainHandler::new(vec![handler(move |ctx, _| {
            if ctx.is_excluded() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })]);

        main.process(
            &config,
            &not_recursive,
            &mut HandlerContext::new(),
            &mut message(),
        );

        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exclusion_matches_origin_form_requests_in_tunnels() {
        // Inside an intercepted tunnel the target is origin-form; the
        // host-based pattern must still match via the Host header.
        let config = ServerConfig::default()
            .with_session_exclusions(vec![Regex::new(r"api\.example\.org").unwrap()]);
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = observed.clone();
        let main = MainHandler::new(vec![handler(move |ctx, _| {
            if ctx.is_excluded() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })]);

        let mut request = HttpRequest::new("GET", "/v1/data");
        request.headers.push("Host", "api.example.org");
        request.secure = true;
        main.process(
            &config,
            &not_recursive,
            &mut HandlerContext::new(),
            &mut HttpMessage::new(request),
        );

        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn serialise_mode_blocks_non_excluded_requests_on_global_lock() {
        let guard = SERIALISE_LOCK.lock();
        let done = Arc::new(AtomicUsize::new(0));
        let done_flag = done.clone();
        let worker = std::thread::spawn(move || {
            let config = ServerConfig::default().with_serialise(true);
            let main = MainHandler::new(vec![]);
            main.process(
                &config,
                &not_recursive,
                &mut HandlerContext::new(),
                &mut message(),
            );
            done_flag.store(1, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        drop(guard);
        worker.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn serialise_mode_excluded_requests_skip_global_lock() {
        let guard = SERIALISE_LOCK.lock();
        let worker = std::thread::spawn(|| {
            let config = ServerConfig::default()
                .with_serialise(true)
                .with_session_exclusions(vec![Regex::new(r"example\.org").unwrap()]);
            let main = MainHandler::new(vec![]);
            main.process(
                &config,
                &not_recursive,
                &mut HandlerContext::new(),
                &mut message(),
            )
        });

        // Completes even while the process-wide lock is held.
        let outcome = worker.join().unwrap();
        assert_eq!(outcome, ProcessOutcome::Write);
        drop(guard);
    }

    #[test]
    fn remove_accept_encoding_strips_client_header() {
        let mut msg = message();
        msg.request.headers.push("Accept-Encoding", "gzip, br");
        let mut ctx = HandlerContext::new();

        RemoveAcceptEncodingHandler
            .handle_message(&mut ctx, &mut msg)
            .unwrap();
        assert!(!msg.request.headers.contains("Accept-Encoding"));
    }

    #[test]
    fn remove_accept_encoding_skips_excluded_messages() {
        let mut msg = message();
        msg.request.headers.push("Accept-Encoding", "gzip");
        let mut ctx = HandlerContext::new();
        ctx.reset_for_request(false, true);

        RemoveAcceptEncodingHandler
            .handle_message(&mut ctx, &mut msg)
            .unwrap();
        assert!(msg.request.headers.contains("Accept-Encoding"));
    }

    #[test]
    fn decode_response_inflates_gzip_bodies() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain body").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut msg = message();
        msg.response = HttpResponse::with_status(200, "OK");
        msg.response.headers.push("Content-Encoding", "gzip");
        msg.response
            .headers
            .push("Content-Length", compressed.len().to_string());
        msg.response.body = compressed;
        let mut ctx = HandlerContext::new();
        ctx.begin_response_phase();

        DecodeResponseHandler
            .handle_message(&mut ctx, &mut msg)
            .unwrap();
        assert_eq!(msg.response.body, b"plain body");
        assert!(!msg.response.headers.contains("Content-Encoding"));
        assert_eq!(msg.response.headers.get("Content-Length"), Some("10"));
    }

    #[test]
    fn decode_response_reports_corrupt_bodies() {
        let mut msg = message();
        msg.response = HttpResponse::with_status(200, "OK");
        msg.response.headers.push("Content-Encoding", "gzip");
        msg.response.body = b"not gzip at all".to_vec();
        let mut ctx = HandlerContext::new();
        ctx.begin_response_phase();

        assert!(DecodeResponseHandler
            .handle_message(&mut ctx, &mut msg)
            .is_err());
    }

    #[test]
    fn decode_response_leaves_unknown_encodings_alone() {
        let mut msg = message();
        msg.response = HttpResponse::with_status(200, "OK");
        msg.response.headers.push("Content-Encoding", "br");
        msg.response.body = b"brotli bytes".to_vec();
        let mut ctx = HandlerContext::new();
        ctx.begin_response_phase();

        DecodeResponseHandler
            .handle_message(&mut ctx, &mut msg)
            .unwrap();
        assert_eq!(msg.response.body, b"brotli bytes");
        assert!(msg.response.headers.contains("Content-Encoding"));
    }
}

//! Command dispatch and the handler for every recognized command.
//!
//! A request is a heterogeneous array whose element 0 names the command.
//! Handlers enqueue their own responses, so commands that produce more than
//! one (subscribe: ack then initial notification) keep their ordering
//! explicit. A handler error becomes a single `{"error": ...}` response and
//! the session stays open.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::clock::{parse_clockspec, ClockSpec};
use crate::daemon_log::daemon_log;
use crate::files::{all_existing, all_records, changed_since, render_files, FileRecord};
use crate::protocol::{annotate_with_clock, error_response, make_response, RequestError};
use crate::query::{parse_name_patterns, patterns_match, Query};
use crate::root::{Root, Subscription};
use crate::trigger;

use super::log_sink::{server_log, LogLevel};
use super::session::Session;
use super::ServerContext;

/// Validates the request envelope and routes to the named handler.
pub async fn dispatch_command(ctx: &Arc<ServerContext>, session: &Session, request: Value) {
    let result = match validate_envelope(&request) {
        Ok((name, args)) => run_command(ctx, session, name, args).await,
        Err(e) => Err(e),
    };
    if let Err(err) = result {
        ctx.enqueue(session.id, error_response(&err));
    }
}

fn validate_envelope(request: &Value) -> Result<(&str, &[Value]), RequestError> {
    let args = request
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or(RequestError::EmptyRequest)?;
    let name = args[0].as_str().ok_or(RequestError::BadCommandName)?;
    Ok((name, args))
}

async fn run_command(
    ctx: &Arc<ServerContext>,
    session: &Session,
    name: &str,
    args: &[Value],
) -> Result<(), RequestError> {
    match name {
        "watch" => cmd_watch(ctx, session, args).await,
        "watch-list" => cmd_watch_list(ctx, session),
        "watch-del" => cmd_watch_del(ctx, session, args).await,
        "find" => cmd_find(ctx, session, args).await,
        "since" => cmd_since(ctx, session, args).await,
        "query" => cmd_query(ctx, session, args).await,
        "subscribe" => cmd_subscribe(ctx, session, args).await,
        "unsubscribe" => cmd_unsubscribe(ctx, session, args).await,
        "trigger" => cmd_trigger(ctx, session, args).await,
        "trigger-list" => cmd_trigger_list(ctx, session, args).await,
        "trigger-del" => cmd_trigger_del(ctx, session, args).await,
        "log-level" => cmd_log_level(ctx, session, args),
        "log" => cmd_log(ctx, session, args),
        "clock" => cmd_clock(ctx, session, args).await,
        "version" => cmd_version(ctx, session),
        "get-sockname" => cmd_get_sockname(ctx, session),
        "get-pid" => cmd_get_pid(ctx, session),
        "shutdown-server" => cmd_shutdown(ctx, session),
        other => Err(RequestError::UnknownCommand { name: other.to_string() }),
    }
}

/// Resolves the root argument at `index`, honoring client mode.
async fn resolve_root_arg(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
    index: usize,
    create: bool,
) -> Result<Arc<Root>, RequestError> {
    let value = args.get(index).ok_or(RequestError::WrongArgCount)?;
    let name = value.as_str().ok_or_else(|| RequestError::BadArgType {
        index,
        expected: "a string naming the root dir".into(),
    })?;
    let resolved = if session.client_mode {
        ctx.roots.resolve_existing(name)
    } else {
        ctx.resolve_root(name, create).await
    };
    resolved.map_err(|message| RequestError::UnresolvedRoot {
        root: name.to_string(),
        message,
    })
}

fn persist_state(ctx: &Arc<ServerContext>) {
    if let Err(e) = crate::state::save(ctx) {
        daemon_log("state", &format!("failed to persist state: {:#}", e));
    }
}

async fn cmd_watch(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, true).await?;
    let mut resp = make_response();
    resp["root"] = Value::String(root.path.display().to_string());
    annotate_with_clock(&mut resp, root.lock().clock.ticks);
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_watch_list(ctx: &Arc<ServerContext>, session: &Session) -> Result<(), RequestError> {
    let roots: Vec<String> = ctx
        .roots
        .paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let mut resp = make_response();
    resp["roots"] = json!(roots);
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_watch_del(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    root.stop_watcher();
    ctx.roots.remove(&root.path);
    persist_state(ctx);
    server_log(
        ctx,
        LogLevel::Info,
        &format!("stopped watching {}", root.path.display()),
    );
    let mut resp = make_response();
    resp["watch-del"] = Value::Bool(true);
    resp["root"] = Value::String(root.path.display().to_string());
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_find(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let patterns = parse_name_patterns(&args[2..])?;

    let state = root.lock();
    let matched: Vec<(&str, &FileRecord)> = all_existing(&state.files)
        .into_iter()
        .filter(|(name, _)| patterns_match(&patterns, name))
        .collect();
    let mut resp = make_response();
    annotate_with_clock(&mut resp, state.clock.ticks);
    resp["files"] = render_files(&matched, None);
    drop(state);

    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_since(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let spec_value = args.get(2).ok_or(RequestError::WrongArgCount)?;
    let patterns = parse_name_patterns(&args[3..])?;

    let mut state = root.lock();
    let spec = parse_clockspec(spec_value, Some(&mut state.clock), true)?;
    let matched: Vec<(&str, &FileRecord)> = changed_since(&state.files, &spec)
        .into_iter()
        .filter(|(name, _)| patterns_match(&patterns, name))
        .collect();
    let mut resp = make_response();
    // The reply is clocked after clockspec resolution so the client's next
    // since-query resumes exactly past this answer.
    annotate_with_clock(&mut resp, state.clock.ticks);
    resp["files"] = render_files(&matched, Some(&spec));
    resp["is_fresh_instance"] = Value::Bool(spec.is_fresh_instance());
    drop(state);

    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_query(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let expr = args.get(2).ok_or(RequestError::WrongArgCount)?;
    let query = Query::parse(expr)?;

    let mut state = root.lock();
    let since = match &query.since {
        Some(v) => Some(parse_clockspec(v, Some(&mut state.clock), true)?),
        None => None,
    };
    let candidates = match &since {
        Some(spec) => changed_since(&state.files, spec),
        None => all_records(&state.files),
    };
    let matched: Vec<(&str, &FileRecord)> = candidates
        .into_iter()
        .filter(|(name, rec)| query.matches(name, rec))
        .collect();
    let mut resp = make_response();
    annotate_with_clock(&mut resp, state.clock.ticks);
    resp["files"] = render_files(&matched, since.as_ref());
    if let Some(spec) = &since {
        resp["is_fresh_instance"] = Value::Bool(spec.is_fresh_instance());
    }
    drop(state);

    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_subscribe(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, true).await?;
    let name = args
        .get(2)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .ok_or_else(|| RequestError::BadArgType {
            index: 2,
            expected: "a string naming the subscription".into(),
        })?;
    let query = Query::parse(args.get(3).unwrap_or(&Value::Null))?;

    let mut state = root.lock();
    // The initial window: an explicit since in the query resumes from it,
    // otherwise the subscriber gets a full fresh-instance snapshot.
    let spec = match &query.since {
        Some(v) => parse_clockspec(v, Some(&mut state.clock), true)?,
        None => ClockSpec::Ticks { ticks: 0, fresh_instance: true },
    };
    let current = state.clock.ticks;
    let matched: Vec<(&str, &FileRecord)> = changed_since(&state.files, &spec)
        .into_iter()
        .filter(|(n, rec)| query.matches(n, rec))
        .collect();

    let mut ack = make_response();
    ack["subscribe"] = Value::String(name.to_string());
    annotate_with_clock(&mut ack, current);

    let mut notification = make_response();
    notification["subscription"] = Value::String(name.to_string());
    notification["root"] = Value::String(root.path.display().to_string());
    annotate_with_clock(&mut notification, current);
    notification["files"] = render_files(&matched, Some(&spec));
    notification["is_fresh_instance"] = Value::Bool(spec.is_fresh_instance());

    // One subscription per (session, name): a re-subscribe replaces.
    state
        .subscriptions
        .retain(|s| !(s.client_id == session.id && s.name == name));
    state.subscriptions.push(Subscription {
        client_id: session.id,
        name: name.to_string(),
        query,
        last_ticks: current,
    });
    drop(state);

    ctx.enqueue(session.id, ack);
    ctx.enqueue(session.id, notification);
    Ok(())
}

async fn cmd_unsubscribe(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let name = args
        .get(2)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .ok_or_else(|| RequestError::BadArgType {
            index: 2,
            expected: "a string naming the subscription".into(),
        })?;

    let mut state = root.lock();
    let before = state.subscriptions.len();
    state
        .subscriptions
        .retain(|s| !(s.client_id == session.id && s.name == name));
    let deleted = state.subscriptions.len() < before;
    drop(state);

    let mut resp = make_response();
    resp["unsubscribe"] = Value::String(name.to_string());
    resp["deleted"] = Value::Bool(deleted);
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_trigger(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, true).await?;
    let def = trigger::parse_trigger_args(args)?;
    let name = def.name.clone();
    root.lock().triggers.insert(name.clone(), def);
    persist_state(ctx);

    let mut resp = make_response();
    resp["triggerid"] = Value::String(name);
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_trigger_list(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let triggers: Vec<Value> = root.lock().triggers.values().map(|d| d.to_value()).collect();
    let mut resp = make_response();
    resp["triggers"] = Value::Array(triggers);
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_trigger_del(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let name = args
        .get(2)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .ok_or_else(|| RequestError::BadArgType {
            index: 2,
            expected: "a string naming the trigger".into(),
        })?;
    let deleted = root.lock().triggers.remove(name).is_some();
    if deleted {
        persist_state(ctx);
    }

    let mut resp = make_response();
    resp["trigger"] = Value::String(name.to_string());
    resp["deleted"] = Value::Bool(deleted);
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_log_level(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let level = args
        .get(1)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .and_then(LogLevel::parse)
        .ok_or_else(|| RequestError::BadArgType {
            index: 1,
            expected: "a log level (off, error, info, debug)".into(),
        })?;
    ctx.set_log_level(session.id, level);

    let mut resp = make_response();
    resp["log_level"] = Value::String(level.as_str().to_string());
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_log(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let level = args
        .get(1)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .and_then(LogLevel::parse)
        .ok_or_else(|| RequestError::BadArgType {
            index: 1,
            expected: "a log level (off, error, info, debug)".into(),
        })?;
    let text = args
        .get(2)
        .ok_or(RequestError::WrongArgCount)?
        .as_str()
        .ok_or_else(|| RequestError::BadArgType {
            index: 2,
            expected: "a string to log".into(),
        })?;
    server_log(ctx, level, text);

    let mut resp = make_response();
    resp["logged"] = Value::Bool(true);
    ctx.enqueue(session.id, resp);
    Ok(())
}

async fn cmd_clock(
    ctx: &Arc<ServerContext>,
    session: &Session,
    args: &[Value],
) -> Result<(), RequestError> {
    let root = resolve_root_arg(ctx, session, args, 1, false).await?;
    let mut resp = make_response();
    annotate_with_clock(&mut resp, root.lock().clock.ticks);
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_version(ctx: &Arc<ServerContext>, session: &Session) -> Result<(), RequestError> {
    ctx.enqueue(session.id, make_response());
    Ok(())
}

fn cmd_get_sockname(ctx: &Arc<ServerContext>, session: &Session) -> Result<(), RequestError> {
    let mut resp = make_response();
    resp["sockname"] = Value::String(ctx.sockname.display().to_string());
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_get_pid(ctx: &Arc<ServerContext>, session: &Session) -> Result<(), RequestError> {
    let mut resp = make_response();
    resp["pid"] = json!(std::process::id());
    ctx.enqueue(session.id, resp);
    Ok(())
}

fn cmd_shutdown(ctx: &Arc<ServerContext>, session: &Session) -> Result<(), RequestError> {
    server_log(ctx, LogLevel::Error, "shutdown-server was requested, exiting!");
    let mut resp = make_response();
    resp["shutdown-server"] = Value::Bool(true);
    ctx.enqueue(session.id, resp);
    ctx.initiate_shutdown();
    Ok(())
}

//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! persistent engine. Writes go through the durability path; reads hit
//! memory only.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ember_common::resp::{self, CommandParser};
use ember_common::EmberError;
use ember_engine::{PersistentEngine, TtlStatus};

const WRONGTYPE_REPLY: &[u8] =
    b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";

/// Handles a single client connection until EOF or protocol violation.
pub async fn handle_connection(
    stream: TcpStream,
    store: Arc<PersistentEngine>,
) -> std::io::Result<()> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = CommandParser::new();

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    let response = dispatch_command(&args, store.as_ref());
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(_) => {
                    stream.write_all(&resp::error("protocol error")).await?;
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}

/// Routes one parsed command to its handler.
pub fn dispatch_command(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.is_empty() {
        return resp::error("empty command");
    }

    let verb = args[0].to_ascii_uppercase();
    match verb.as_slice() {
        b"PING" => handle_ping(args),
        b"SET" => handle_set(args, store),
        b"GET" => handle_get(args, store),
        b"DEL" => handle_del(args, store),
        b"EXISTS" => handle_exists(args, store),
        b"TTL" => handle_ttl(args, store),
        b"EXPIRE" => handle_expire(args, store),
        b"PERSIST" => handle_persist(args, store),
        b"ZADD" => handle_zadd(args, store),
        b"ZREM" => handle_zrem(args, store),
        b"ZSCORE" => handle_zscore(args, store),
        b"ZRANK" => handle_zrank(args, store, false),
        b"ZREVRANK" => handle_zrank(args, store, true),
        b"ZRANGE" => handle_zrange(args, store, false),
        b"ZREVRANGE" => handle_zrange(args, store, true),
        b"ZRANGEBYSCORE" => handle_zrange_by_score(args, store),
        b"ZINCRBY" => handle_zincrby(args, store),
        b"ZCARD" => handle_zcard(args, store),
        b"FLUSH" => handle_flush(args, store),
        b"INFO" => handle_info(store),
        _ => resp::error("unknown command"),
    }
}

fn engine_error(err: EmberError) -> Vec<u8> {
    match err {
        EmberError::WrongType => WRONGTYPE_REPLY.to_vec(),
        EmberError::InvalidArgument(msg) => resp::error(&msg),
        EmberError::Durability(msg) => {
            tracing::error!(%msg, "write rejected by durability layer");
            resp::error(&format!("durability failure: {msg}"))
        }
        other => {
            tracing::error!(error = %other, "engine error");
            resp::error("engine error")
        }
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp::simple("PONG"),
        2 => resp::bulk(&args[1]),
        _ => resp::error("wrong number of arguments for PING"),
    }
}

fn handle_set(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 3 && args.len() != 5 {
        return resp::error("wrong number of arguments for SET");
    }

    let ttl = if args.len() == 5 {
        if !args[3].eq_ignore_ascii_case(b"EX") {
            return resp::error("unsupported SET option");
        }
        match parse_u64(&args[4]) {
            Some(seconds) if seconds > 0 => Some(Duration::from_secs(seconds)),
            _ => return resp::error("invalid expire time"),
        }
    } else {
        None
    };

    match store.set(&args[1], &args[2], ttl) {
        Ok(()) => resp::simple("OK"),
        Err(err) => engine_error(err),
    }
}

fn handle_get(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 2 {
        return resp::error("wrong number of arguments for GET");
    }
    match store.engine().get(&args[1]) {
        Ok(Some(value)) => resp::bulk(&value),
        Ok(None) => resp::null_bulk(),
        Err(err) => engine_error(err),
    }
}

fn handle_del(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() < 2 {
        return resp::error("wrong number of arguments for DEL");
    }
    let mut removed = 0i64;
    for key in &args[1..] {
        match store.delete(key) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => return engine_error(err),
        }
    }
    resp::integer(removed)
}

fn handle_exists(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 2 {
        return resp::error("wrong number of arguments for EXISTS");
    }
    resp::integer(store.engine().exists(&args[1]) as i64)
}

fn handle_ttl(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 2 {
        return resp::error("wrong number of arguments for TTL");
    }
    match store.ttl(&args[1]) {
        TtlStatus::Missing => resp::integer(-2),
        TtlStatus::NoExpiry => resp::integer(-1),
        TtlStatus::ExpiresIn(remaining) => resp::integer(remaining.as_secs() as i64),
    }
}

fn handle_expire(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 3 {
        return resp::error("wrong number of arguments for EXPIRE");
    }
    let Some(seconds) = parse_u64(&args[2]) else {
        return resp::error("invalid expire time");
    };
    match store.expire(&args[1], Duration::from_secs(seconds)) {
        Ok(true) => resp::integer(1),
        Ok(false) => resp::integer(0),
        Err(err) => engine_error(err),
    }
}

fn handle_persist(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 2 {
        return resp::error("wrong number of arguments for PERSIST");
    }
    match store.persist_key(&args[1]) {
        Ok(true) => resp::integer(1),
        Ok(false) => resp::integer(0),
        Err(err) => engine_error(err),
    }
}

fn handle_zadd(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 4 {
        return resp::error("wrong number of arguments for ZADD");
    }
    let Some(score) = parse_score(&args[2]) else {
        return resp::error("value is not a valid float");
    };
    match store.zadd(&args[1], &args[3], score) {
        Ok(added) => resp::integer(added as i64),
        Err(err) => engine_error(err),
    }
}

fn handle_zrem(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 3 {
        return resp::error("wrong number of arguments for ZREM");
    }
    match store.zrem(&args[1], &args[2]) {
        Ok(removed) => resp::integer(removed as i64),
        Err(err) => engine_error(err),
    }
}

fn handle_zscore(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 3 {
        return resp::error("wrong number of arguments for ZSCORE");
    }
    match store.engine().zscore(&args[1], &args[2]) {
        Ok(Some(score)) => resp::bulk(resp::format_score(score).as_bytes()),
        Ok(None) => resp::null_bulk(),
        Err(err) => engine_error(err),
    }
}

fn handle_zrank(args: &[Vec<u8>], store: &PersistentEngine, reverse: bool) -> Vec<u8> {
    if args.len() != 3 {
        return resp::error("wrong number of arguments for ZRANK");
    }
    let rank = if reverse {
        store.engine().zrev_rank(&args[1], &args[2])
    } else {
        store.engine().zrank(&args[1], &args[2])
    };
    match rank {
        Ok(Some(rank)) => resp::integer(rank as i64),
        Ok(None) => resp::null_bulk(),
        Err(err) => engine_error(err),
    }
}

fn handle_zrange(args: &[Vec<u8>], store: &PersistentEngine, reverse: bool) -> Vec<u8> {
    let with_scores = match args.len() {
        4 => false,
        5 if args[4].eq_ignore_ascii_case(b"WITHSCORES") => true,
        _ => return resp::error("wrong number of arguments for ZRANGE"),
    };
    let (Some(start), Some(stop)) = (parse_i64(&args[2]), parse_i64(&args[3])) else {
        return resp::error("value is not an integer");
    };

    let range = if reverse {
        store.engine().zrev_range(&args[1], start, stop)
    } else {
        store.engine().zrange(&args[1], start, stop)
    };
    match range {
        Ok(pairs) => pairs_reply(&pairs, with_scores),
        Err(err) => engine_error(err),
    }
}

fn handle_zrange_by_score(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    let with_scores = match args.len() {
        4 => false,
        5 if args[4].eq_ignore_ascii_case(b"WITHSCORES") => true,
        _ => return resp::error("wrong number of arguments for ZRANGEBYSCORE"),
    };
    let (Some(min), Some(max)) = (parse_score_bound(&args[2]), parse_score_bound(&args[3]))
    else {
        return resp::error("min or max is not a float");
    };

    match store.engine().zrange_by_score(&args[1], min, max) {
        Ok(pairs) => pairs_reply(&pairs, with_scores),
        Err(err) => engine_error(err),
    }
}

fn handle_zincrby(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 4 {
        return resp::error("wrong number of arguments for ZINCRBY");
    }
    let Some(delta) = parse_score(&args[2]) else {
        return resp::error("value is not a valid float");
    };
    match store.zincr_by(&args[1], &args[3], delta) {
        Ok(score) => resp::bulk(resp::format_score(score).as_bytes()),
        Err(err) => engine_error(err),
    }
}

fn handle_zcard(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 2 {
        return resp::error("wrong number of arguments for ZCARD");
    }
    match store.engine().zcard(&args[1]) {
        Ok(count) => resp::integer(count as i64),
        Err(err) => engine_error(err),
    }
}

fn handle_flush(args: &[Vec<u8>], store: &PersistentEngine) -> Vec<u8> {
    if args.len() != 1 {
        return resp::error("wrong number of arguments for FLUSH");
    }
    match store.flush() {
        Ok(()) => resp::simple("OK"),
        Err(err) => engine_error(err),
    }
}

fn handle_info(store: &PersistentEngine) -> Vec<u8> {
    let stats = store.engine().stats();
    let info = format!(
        "role:cache\r\nengine:ember\r\nnode_id:{}\r\npersistence:{}\r\nentries:{}\r\nhits:{}\r\nmisses:{}\r\nevictions:{}\r\nexpirations:{}\r\n",
        store.node_id(),
        store.persistence_enabled(),
        stats.entries,
        stats.hits,
        stats.misses,
        stats.evictions,
        stats.expirations,
    );
    resp::bulk(info.as_bytes())
}

fn pairs_reply(pairs: &[(Vec<u8>, f64)], with_scores: bool) -> Vec<u8> {
    let mut items = Vec::with_capacity(pairs.len() * if with_scores { 2 } else { 1 });
    for (member, score) in pairs {
        items.push(resp::bulk(member));
        if with_scores {
            items.push(resp::bulk(resp::format_score(*score).as_bytes()));
        }
    }
    resp::array(&items)
}

fn parse_u64(arg: &[u8]) -> Option<u64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_score(arg: &[u8]) -> Option<f64> {
    let score: f64 = std::str::from_utf8(arg).ok()?.parse().ok()?;
    score.is_finite().then_some(score)
}

/// Like [`parse_score`] but admits the `-inf` / `+inf` range sentinels.
fn parse_score_bound(arg: &[u8]) -> Option<f64> {
    match arg.to_ascii_lowercase().as_slice() {
        b"-inf" => Some(f64::NEG_INFINITY),
        b"+inf" | b"inf" => Some(f64::INFINITY),
        _ => parse_score(arg),
    }
}

//! The per-datagram pipeline of the filtering DNS forwarder: parse a
//! query, classify it against the blocklist, and produce the reply
//! bytes - a synthesised negative response or the upstream's answer
//! verbatim.
//!
//! The pipeline is deliberately sequential: callers drive one
//! datagram at a time, and the upstream wait for one client blocks
//! the next.

#![warn(clippy::pedantic)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::wildcard_imports)]

pub mod stats;
pub mod upstream;

use dns_types::blocklist::types::Blocklist;
use dns_types::protocol::serialise::negative_response_from_raw;
use dns_types::protocol::types::*;

use self::stats::Stats;

/// Dispose of one datagram, producing the bytes to send back, if
/// any.
///
/// - runt datagrams (shorter than a header) are dropped
/// - unparseable queries get a best-effort `FORMERR`, or are dropped
///   when not even the question section can be recovered
/// - queries with no question get `FORMERR`
/// - queries whose first question is not type A get `NOTIMPL`
/// - queries for a blocked name get `NXDOMAIN`
/// - everything else is forwarded, and the upstream's reply returned
///   unchanged - or `SERVFAIL` if the exchange fails
///
/// Only the first question is considered.  The type check comes
/// before the blocklist: a blocked name asked with the wrong type is
/// still `NOTIMPL`.
pub async fn handle_datagram(
    blocklist: &Blocklist,
    upstream_address: &str,
    upstream_port: u16,
    stats: &mut Stats,
    raw: &[u8],
) -> Option<Vec<u8>> {
    if raw.len() < WIRE_HEADER_LEN {
        tracing::debug!(length = %raw.len(), "ignoring runt datagram");
        return None;
    }

    stats.received();

    let message = match Message::from_octets(raw) {
        Ok(message) => message,
        Err(error) => {
            tracing::debug!(?error, "could not parse query");
            return match negative_response_from_raw(raw, Rcode::FormatError) {
                Ok(response) => {
                    stats.error();
                    tracing::info!(rcode = %Rcode::FormatError, "unparseable query");
                    Some(response)
                }
                Err(error) => {
                    tracing::debug!(?error, "question not recoverable, dropping");
                    None
                }
            };
        }
    };

    let question = match message.first_question() {
        Some(question) => question,
        None => {
            stats.error();
            tracing::info!(id = %message.header.id, rcode = %Rcode::FormatError, "no question");
            return synthesise(&message, Rcode::FormatError);
        }
    };

    if question.qtype != QueryType::A {
        stats.error();
        tracing::info!(
            id = %message.header.id,
            %question,
            rcode = %Rcode::NotImplemented,
            "query type not implemented"
        );
        return synthesise(&message, Rcode::NotImplemented);
    }

    if blocklist.is_blocked(&question.name.to_dotted_string()) {
        stats.blocked();
        tracing::info!(
            id = %message.header.id,
            %question,
            rcode = %Rcode::NameError,
            "blocked"
        );
        return synthesise(&message, Rcode::NameError);
    }

    match upstream::exchange(upstream_address, upstream_port, raw).await {
        Ok(reply) => {
            stats.forwarded();
            tracing::info!(
                id = %message.header.id,
                %question,
                length = %reply.len(),
                "forwarded"
            );
            Some(reply)
        }
        Err(error) => {
            stats.error();
            tracing::info!(
                id = %message.header.id,
                %question,
                %error,
                rcode = %Rcode::ServerFailure,
                "upstream exchange failed"
            );
            synthesise(&message, Rcode::ServerFailure)
        }
    }
}

/// A negative response for a query that did parse.  Synthesis can
/// still fail (a parseable QNAME may use compression, which cannot be
/// echoed verbatim); the datagram is then dropped.
fn synthesise(message: &Message, rcode: Rcode) -> Option<Vec<u8>> {
    match message.negative_response(rcode) {
        Ok(response) => Some(response),
        Err(error) => {
            tracing::debug!(?error, %rcode, "could not synthesise response, dropping");
            None
        }
    }
}

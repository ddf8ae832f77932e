/// Protocol executor
///
/// Stateless per call: drives exactly one query through one
/// request/response round on the port, validates the response, maps
/// device exceptions onto query statuses and applies the outcome to the
/// covered register slots. A permanent address/value rejection of a
/// holey multi-register query is split once into halves; a second
/// rejection is final.
///
/// Transport write failures and closed streams propagate as errors (the
/// scheduler reopens the port); everything else is absorbed into the
/// query status.
use crate::codec::{self, ResponsePayload};
use crate::device::DeviceConfig;
use crate::error::{BusError, BusResult};
use crate::events::PendingEvent;
use crate::logging::CallbackLogger;
use crate::protocol::{self, FunctionCode, QueryStatus, SlaveId};
use crate::query::{Query, QueryOperation};
use crate::register::RegisterSlot;
use crate::transport::{Port, MAX_FRAME_SIZE};

/// Outcome of one request/response round
enum RoundOutcome {
    /// Events to dispatch; the query status tells what happened
    Completed(Vec<PendingEvent>),
    /// The device rejected a holey range; retry the halves
    Split(Query, Query),
}

/// Execute one query against the device behind `config`
///
/// On return the query status tells what happened; the returned events
/// carry the value changes and error transitions to dispatch.
pub async fn execute_query(
    port: &mut (dyn Port + Send),
    config: &DeviceConfig,
    slots: &mut [RegisterSlot],
    query: &mut Query,
    logger: &CallbackLogger,
) -> BusResult<Vec<PendingEvent>> {
    let (low, high) = match run_round(port, config, slots, query, logger, true).await? {
        RoundOutcome::Completed(events) => return Ok(events),
        RoundOutcome::Split(low, high) => (low, high),
    };

    logger.debug(&format!(
        "{}: splitting into '{}' and '{}'",
        config.id,
        low.describe(),
        high.describe()
    ));

    let mut events = Vec::new();
    for mut half in [low, high] {
        match run_round(port, config, slots, &mut half, logger, false).await? {
            RoundOutcome::Completed(half_events) => events.extend(half_events),
            RoundOutcome::Split(..) => {
                return Err(BusError::internal("split query asked to split again"))
            }
        }
    }
    Ok(events)
}

async fn run_round(
    port: &mut (dyn Port + Send),
    config: &DeviceConfig,
    slots: &mut [RegisterSlot],
    query: &mut Query,
    logger: &CallbackLogger,
    allow_split: bool,
) -> BusResult<RoundOutcome> {
    if let Some(guard) = config.guard_interval() {
        port.sleep(guard).await;
    }

    logger.debug(&format!("{}: {}", config.id, query.describe()));

    let request = build_request(config.slave_id, query)?;
    port.write_bytes(&request).await?;

    let expected = match query.operation() {
        QueryOperation::Read => {
            codec::read_response_len(query.kind().is_single_bit(), query.count())
        }
        QueryOperation::Write => codec::write_response_len(),
    };
    let frame_complete = codec::expect_frame(expected);
    let response = match port
        .read_frame(MAX_FRAME_SIZE, config.frame_timeout(), &frame_complete)
        .await
    {
        Ok(response) => response,
        Err(error) if error.is_recoverable() => {
            logger.warn(&format!(
                "{}: {} failed: {}",
                config.id,
                query.describe(),
                error
            ));
            return Ok(RoundOutcome::Completed(
                query.fail(slots, QueryStatus::TransientError),
            ));
        }
        Err(error) => return Err(error),
    };

    let payload = match codec::parse_response(&request, &response) {
        Ok(payload) => payload,
        Err(error) => {
            logger.warn(&format!(
                "{}: {} rejected: {}",
                config.id,
                query.describe(),
                error
            ));
            let status = match error {
                // an unparseable frame leaves unknown garbage on the line
                BusError::CrcMismatch { .. } | BusError::Frame { .. } => {
                    if let Err(skip_error) = port.skip_noise().await {
                        logger.warn(&format!("skip noise failed: {}", skip_error));
                    }
                    QueryStatus::UnknownError
                }
                _ => QueryStatus::TransientError,
            };
            return Ok(RoundOutcome::Completed(query.fail(slots, status)));
        }
    };

    match payload {
        ResponsePayload::Exception(code) => {
            let status = QueryStatus::from_exception(code);
            logger.warn(&format!(
                "{}: {} answered {} ({})",
                config.id,
                query.describe(),
                BusError::exception(query.function().to_u8(), code),
                status
            ));

            let may_split = allow_split
                && status == QueryStatus::PermanentError
                && protocol::exception_localizable_to_hole(code)
                && query.splittable()
                && query.has_holes();
            if may_split {
                if let Some((low, high)) = query.split() {
                    query.set_splittable(false);
                    query.set_status(status);
                    return Ok(RoundOutcome::Split(low, high));
                }
            }
            Ok(RoundOutcome::Completed(query.fail(slots, status)))
        }
        ResponsePayload::Read(data) => match query.finalize_read(slots, &data) {
            Ok(events) => Ok(RoundOutcome::Completed(events)),
            Err(error) => {
                logger.warn(&format!(
                    "{}: {} returned malformed data: {}",
                    config.id,
                    query.describe(),
                    error
                ));
                Ok(RoundOutcome::Completed(
                    query.fail(slots, QueryStatus::UnknownError),
                ))
            }
        },
        ResponsePayload::Write => Ok(RoundOutcome::Completed(query.finalize_write(slots))),
    }
}

/// Compose the request frame for a query
fn build_request(slave_id: SlaveId, query: &Query) -> BusResult<Vec<u8>> {
    match query.operation() {
        QueryOperation::Read => {
            codec::build_read_request(slave_id, query.function(), query.start(), query.count())
        }
        QueryOperation::Write => {
            let function = query.function();
            if function.is_multi_write() {
                let payload = if function == FunctionCode::WriteMultipleCoils {
                    let bits: Vec<bool> = query.write_words().iter().map(|&w| w != 0).collect();
                    codec::pack_coils(&bits)
                } else {
                    codec::words_to_bytes(query.write_words())
                };
                codec::build_multi_write(slave_id, function, query.start(), query.count(), &payload)
            } else {
                codec::build_single_write(
                    slave_id,
                    function,
                    query.start(),
                    query.write_words()[0],
                )
            }
        }
    }
}

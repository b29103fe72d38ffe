//! Base-rate negotiation.

use std::time::Duration;

use crate::comms::Comms;
use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, Tag};
use crate::params::VOICE_MASTER;
use crate::time::{self, SampleRate};

/// Agrees with all voices on the base rate of the execution.
///
/// Every voice contributes the rates of its processes and the master derives
/// the base rate from all of them. If the master fails, it notifies its
/// peers before returning so that none of them waits for the result.
pub(crate) fn negotiate_base_rate(
    comms: &Comms,
    rates: &[SampleRate],
    timeout: Duration,
) -> Result<SampleRate, Error> {
    let voice = comms.voice();
    if voice.count == 1 {
        return time::base_rate(rates);
    }

    if !voice.is_master() {
        let mut ipm = comms.pool().get(Tag::PushRates);
        ipm.append_bytes(&encode_rates(rates));
        comms.push(VOICE_MASTER, ipm)?;

        let reply = comms.pull_tag(VOICE_MASTER, Tag::PushBaseRate, timeout)?;
        return match decode_rates(&reply)?.as_slice() {
            [base] => Ok(*base),
            other => Err(Error::new(
                ErrorCode::Comms,
                format!("PUSHBASERATE carries {} rates instead of one", other.len()),
            )),
        };
    }

    let mut all = rates.to_vec();
    let negotiated = (1..voice.count)
        .try_for_each(|peer| {
            let ipm = comms.pull_tag(peer, Tag::PushRates, timeout)?;
            all.extend(decode_rates(&ipm)?);
            Ok(())
        })
        .and_then(|_| time::base_rate(&all));

    match negotiated {
        Ok(base) => {
            comms.broadcast(Tag::PushBaseRate, &encode_rates(&[base]))?;
            tracing::debug!("negotiated base rate {} Hz from {} rates", base, all.len());
            Ok(base)
        }
        Err(e) => {
            comms.notify_abort(&e);
            Err(e)
        }
    }
}

fn encode_rates(rates: &[SampleRate]) -> Vec<u8> {
    let mut body = Vec::with_capacity(rates.len() * 16);
    for rate in rates {
        body.extend_from_slice(&rate.num().to_le_bytes());
        body.extend_from_slice(&rate.den().to_le_bytes());
    }

    body
}

fn decode_rates(ipm: &Ipm) -> Result<Vec<SampleRate>, Error> {
    let malformed = || {
        Error::new(
            ErrorCode::Comms,
            format!("malformed {} from voice {}", ipm.tag(), ipm.source()),
        )
    };
    if ipm.body().len() % 16 != 0 {
        return Err(malformed());
    }

    let mut reader = ipm.reader();
    let mut rates = Vec::with_capacity(ipm.body().len() / 16);
    while reader.remaining() > 0 {
        let num = reader.read_u64()?;
        let den = reader.read_u64()?;
        rates.push(SampleRate::new(num, den).map_err(|_| malformed())?);
    }

    Ok(rates)
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    use std::thread;

    use crate::params::ExecParams;

    fn hz(hz: u64) -> SampleRate {
        SampleRate::hz(hz).unwrap()
    }

    fn negotiate_all(rates: Vec<Vec<SampleRate>>) -> Vec<Result<SampleRate, Error>> {
        let params = ExecParams::default().with_comms_timeout(Duration::from_secs(5));
        let voices = Comms::loopback(rates.len(), &params).unwrap();

        let handles: Vec<_> = voices
            .into_iter()
            .zip(rates)
            .map(|(comms, rates)| {
                thread::spawn(move || negotiate_base_rate(&comms, &rates, Duration::from_secs(5)))
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn voices_agree_on_the_base_rate() {
        let results = negotiate_all(vec![vec![hz(10)], vec![hz(15)], vec![]]);
        for result in results {
            assert_eq!(result.unwrap(), hz(30));
        }
    }

    #[test]
    fn overflow_reaches_every_voice() {
        let huge = SampleRate::new(u64::MAX, 1).unwrap();
        let results = negotiate_all(vec![vec![huge], vec![SampleRate::new(u64::MAX - 1, 1).unwrap()]]);
        for result in results {
            assert_eq!(result.unwrap_err().code(), ErrorCode::Unrepresentable);
        }
    }

    #[test]
    fn solo_voice_negotiates_locally() {
        let comms = Comms::solo();
        let base = negotiate_base_rate(&comms, &[hz(4), hz(6)], Duration::ZERO).unwrap();
        assert_eq!(base, hz(12));
    }
}

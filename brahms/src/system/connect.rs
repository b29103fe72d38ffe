//! Connect phase.
//!
//! Processes create their outputs in `InitConnect`, possibly only once some
//! of their inputs are known, so links are resolved over several passes. In
//! each global pass every voice in turn runs a *local pass* while all other
//! voices *serve* it, answering its requests for their outputs:
//!
//! ```text
//!              pass 0          pass 1          pass 2
//!  voice 0  [  local   ]  [  serve   ]  [  serve   ]
//!  voice 1  [  serve   ]  [  local   ]  [  serve   ]
//!  voice 2  [  serve   ]  [  serve   ]  [  local   ]
//!                  \______________|_______________/
//!                        global pass complete
//! ```
//!
//! The phase ends when a global pass leaves every process finished, and is
//! deadlocked when a global pass makes no progress at all.

use std::sync::Arc;
use std::time::Duration;

use crate::comms::Comms;
use crate::component::InputInfo;
use crate::error::{Error, ErrorCode};
use crate::ipm::{Ipm, Tag};
use crate::params::VoiceIndex;
use crate::ports::DataSpec;
use crate::registry::Handle;
use crate::thread::workers::Workers;
use crate::thread::Phase;
use crate::time::SampleRate;

use super::{Output, Process, Source, System};

/// Outcome of a local pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PassResult {
    /// An output was created or a link was resolved.
    pub(crate) progress: bool,
    /// Every local process is finished.
    pub(crate) finished: bool,
}

impl PassResult {
    fn merge(self, other: Self) -> Self {
        Self {
            progress: self.progress || other.progress,
            finished: self.finished && other.finished,
        }
    }

    fn encode(self) -> [u8; 2] {
        [self.progress as u8, self.finished as u8]
    }

    fn decode(ipm: &Ipm) -> Result<Self, Error> {
        let mut reader = ipm.reader();
        let progress = reader.read_u8()?;
        let finished = reader.read_u8()?;
        reader.finish()?;
        if progress > 1 || finished > 1 {
            return Err(Error::new(ErrorCode::Comms, "malformed ENDPHASE message"));
        }

        Ok(Self {
            progress: progress == 1,
            finished: finished == 1,
        })
    }
}

/// State of the connect phase as seen by one voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectState {
    /// This voice runs pass `n`.
    LocalPass(VoiceIndex),
    /// This voice serves pass `n`, run by voice `n`.
    RemotePass(VoiceIndex),
    /// All voices ran their pass.
    GlobalPassComplete,
    /// Every input of every voice is resolved.
    Finished,
    /// A global pass made no progress.
    Deadlocked,
}

/// Pure state machine sequencing the passes of the connect phase.
#[derive(Clone, Debug)]
pub(crate) struct ConnectPhase {
    index: VoiceIndex,
    count: usize,
    state: ConnectState,
    global: PassResult,
    global_passes: u32,
}

impl ConnectPhase {
    pub(crate) fn new(index: VoiceIndex, count: usize) -> Self {
        Self {
            index,
            count,
            state: Self::pass(index, 0),
            global: Self::fresh(),
            global_passes: 0,
        }
    }

    fn fresh() -> PassResult {
        PassResult {
            progress: false,
            finished: true,
        }
    }

    fn pass(index: VoiceIndex, n: VoiceIndex) -> ConnectState {
        if n == index {
            ConnectState::LocalPass(n)
        } else {
            ConnectState::RemotePass(n)
        }
    }

    pub(crate) fn state(&self) -> ConnectState {
        self.state
    }

    /// Number of completed global passes.
    pub(crate) fn global_passes(&self) -> u32 {
        self.global_passes
    }

    /// Accounts the result of the current pass and moves to the next one.
    pub(crate) fn complete_pass(&mut self, result: PassResult) {
        let n = match self.state {
            ConnectState::LocalPass(n) | ConnectState::RemotePass(n) => n,
            _ => return,
        };
        self.global = self.global.merge(result);
        self.state = if n + 1 < self.count {
            Self::pass(self.index, n + 1)
        } else {
            self.global_passes += 1;
            ConnectState::GlobalPassComplete
        };
    }

    /// Concludes a complete global pass.
    pub(crate) fn advance(&mut self) {
        if self.state != ConnectState::GlobalPassComplete {
            return;
        }
        self.state = match self.global {
            PassResult { finished: true, .. } => ConnectState::Finished,
            PassResult { progress: false, .. } => ConnectState::Deadlocked,
            _ => {
                self.global = Self::fresh();
                Self::pass(self.index, 0)
            }
        };
    }
}

impl System {
    /// Runs the connect phase to completion.
    pub(crate) fn connect(
        &mut self,
        comms: &Comms,
        workers: &Workers,
        timeout: Duration,
    ) -> Result<(), Error> {
        let voice = comms.voice();
        let mut phase = ConnectPhase::new(voice.index, voice.count);
        loop {
            match phase.state() {
                ConnectState::LocalPass(_) => {
                    let result = self.local_pass(comms, workers, timeout)?;
                    phase.complete_pass(result);
                }
                ConnectState::RemotePass(n) => {
                    let result = self.serve_pass(comms, n, timeout)?;
                    phase.complete_pass(result);
                }
                ConnectState::GlobalPassComplete => phase.advance(),
                ConnectState::Finished => {
                    tracing::debug!(
                        "connect phase finished after {} global passes",
                        phase.global_passes()
                    );
                    return Ok(());
                }
                ConnectState::Deadlocked => return Err(self.deadlock_error()),
            }
        }
    }

    /// Runs the local pass of this voice.
    pub(crate) fn local_pass(
        &mut self,
        comms: &Comms,
        workers: &Workers,
        timeout: Duration,
    ) -> Result<PassResult, Error> {
        let local = self.voice.index;
        let mut progress = false;

        let remote: Vec<usize> = (0..self.links.len())
            .filter(|&l| {
                let link = &self.links[l];
                link.dst_voice == local && link.src_voice != local && link.source.is_none()
            })
            .collect();
        for &l in &remote {
            let link = &self.links[l];
            let mut request = comms.pool().get(Tag::FindOutput);
            request.append_u32(link.stream);
            request.append_string(&link.src.process);
            request.append_string(&link.src.port);
            comms.push(link.src_voice, request)?;
        }
        for &l in &remote {
            let (from, stream) = (self.links[l].src_voice, self.links[l].stream);
            let reply = comms.pull(from, timeout)?;
            if let Some((spec, rate)) = decode_reply(&reply, stream)? {
                self.resolve(
                    l,
                    Source {
                        spec,
                        rate,
                        output: None,
                    },
                )?;
                progress = true;
            }
        }

        loop {
            let mut changed = false;

            for l in 0..self.links.len() {
                let link = &self.links[l];
                if link.source.is_some() || link.dst_voice != local || link.src_voice != local {
                    continue;
                }
                let key = (link.src.process.clone(), link.src.port.clone());
                if let Some(&h) = self.output_index.get(&key) {
                    let output = self.outputs.resolve(h)?;
                    let source = Source {
                        spec: output.spec.clone(),
                        rate: output.rate,
                        output: Some(h),
                    };
                    self.resolve(l, source)?;
                    changed = true;
                }
            }

            for h in self.order.clone() {
                if !self.processes.resolve(h)?.fired {
                    changed |= self.connect_process(h, workers)? > 0;
                }
            }

            progress |= changed;
            if !changed {
                break;
            }
        }

        let finished = self
            .links
            .iter()
            .all(|link| link.dst_voice != local || link.source.is_some())
            && self.processes.iter().all(|(_, p)| p.fired);
        let result = PassResult { progress, finished };
        comms.broadcast(Tag::EndPhase, &result.encode())?;

        Ok(result)
    }

    /// Serves the local pass of voice `active`.
    pub(crate) fn serve_pass(
        &mut self,
        comms: &Comms,
        active: VoiceIndex,
        timeout: Duration,
    ) -> Result<PassResult, Error> {
        loop {
            let ipm = comms.pull(active, timeout)?;
            match ipm.tag() {
                Tag::FindOutput => {
                    let mut reader = ipm.reader();
                    let stream = reader.read_u32()?;
                    let process = reader.read_string()?;
                    let port = reader.read_string()?;
                    reader.finish()?;

                    let key = (process.to_owned(), port.to_owned());
                    let reply = match self.output_index.get(&key) {
                        Some(&h) => {
                            let output = self.outputs.resolve_mut(h)?;
                            if !output.remote.contains(&(active, stream)) {
                                output.remote.push((active, stream));
                            }
                            found_reply(comms, stream, output)
                        }
                        None => {
                            let mut reply = comms.pool().get(Tag::OutputNotFound);
                            reply.append_u32(stream);
                            reply
                        }
                    };
                    comms.push(active, reply)?;
                }
                Tag::EndPhase => return PassResult::decode(&ipm),
                other => {
                    return Err(Error::new(
                        ErrorCode::Comms,
                        format!(
                            "unexpected {} from voice {} during the connect phase",
                            other, active
                        ),
                    ))
                }
            }
        }
    }

    /// Attaches the source of a link to its destination input.
    fn resolve(&mut self, link: usize, source: Source) -> Result<(), Error> {
        let l = &self.links[link];
        let h = *self.by_name.get(&l.dst.process).ok_or_else(|| {
            Error::new(
                ErrorCode::Internal,
                format!("unknown process '{}'", l.dst.process),
            )
        })?;
        let info = InputInfo {
            name: l.dst.port.clone(),
            source: format!("{}>>{}", l.src.process, l.src.port),
            spec: source.spec.clone(),
            sample_rate: source.rate,
            lag: l.lag,
        };
        tracing::debug!("resolved {} -> {}", info.source, l.dst);

        let p = self.processes.resolve_mut(h)?;
        p.inputs.push(info);
        p.input_links.push(link);
        p.fired = false;
        self.links[link].source = Some(source);

        Ok(())
    }

    /// Fires `InitConnect` on a process and registers the outputs it
    /// created; returns their number.
    fn connect_process(&mut self, h: Handle<Process>, workers: &Workers) -> Result<usize, Error> {
        let p = self.processes.resolve(h)?;
        let cell = p.cell.clone();
        let inputs = p.inputs.clone();
        let mut outputs = p.outputs.clone();
        let before = outputs.len();

        let outputs = if p.pinned() {
            workers
                .call_on(p.worker, move |cx| {
                    cx.begin_phase(Phase::Init);
                    let result = cell.lock().unwrap().fire_connect(&inputs, &mut outputs);
                    cx.end_phase();
                    result.map(|_| outputs)
                })
                .and_then(|result| result)?
        } else {
            cell.lock().unwrap().fire_connect(&inputs, &mut outputs)?;
            outputs
        };

        let p = self.processes.resolve_mut(h)?;
        p.fired = true;
        let process = p.name.clone();
        let rate = p.rate;
        let created: Vec<(String, DataSpec)> = outputs[before..].to_vec();
        p.outputs = outputs;

        for (port, spec) in &created {
            let handle = self.outputs.insert(Output {
                process: process.clone(),
                port: Arc::from(port.as_str()),
                spec: spec.clone(),
                rate,
                remote: Vec::new(),
                ring: None,
            });
            self.output_index
                .insert((process.to_string(), port.clone()), handle);
            self.processes.resolve_mut(h)?.output_handles.push(handle);
            tracing::debug!("{}>>{} created as {:?}", process, port, spec);
        }

        Ok(created.len())
    }

    /// Lists the unresolved local inputs in an `E_DEADLOCK` error.
    fn deadlock_error(&self) -> Error {
        let unresolved: Vec<String> = self
            .links
            .iter()
            .filter(|link| link.dst_voice == self.voice.index && link.source.is_none())
            .map(|link| {
                format!(
                    "{}<<{} (from {}>>{})",
                    link.dst.process, link.dst.port, link.src.process, link.src.port
                )
            })
            .collect();
        for input in &unresolved {
            tracing::error!("unresolved input {}", input);
        }

        let message = if unresolved.is_empty() {
            format!(
                "connect phase deadlocked on another voice (voice {} is resolved)",
                self.voice.index
            )
        } else {
            format!(
                "connect phase deadlocked with unresolved inputs: {}",
                unresolved.join(", ")
            )
        };

        Error::new(ErrorCode::Deadlock, message)
    }
}

fn found_reply(comms: &Comms, stream: u32, output: &Output) -> Ipm {
    let mut reply = comms.pool().get(Tag::OutputFound);
    reply.append_u32(stream);
    reply.append_string(output.spec.class());
    reply.append_string(output.spec.structure());
    reply.append_u64(output.spec.sample_bytes() as u64);
    reply.append_u64(output.rate.num());
    reply.append_u64(output.rate.den());

    reply
}

/// Decodes the answer to a `FINDOUTPUT` request.
fn decode_reply(reply: &Ipm, stream: u32) -> Result<Option<(DataSpec, SampleRate)>, Error> {
    let mut reader = reply.reader();
    let found = match reply.tag() {
        Tag::OutputFound => true,
        Tag::OutputNotFound => false,
        other => {
            return Err(Error::new(
                ErrorCode::Comms,
                format!("expected an answer to FINDOUTPUT but received {}", other),
            ))
        }
    };
    let answered = reader.read_u32()?;
    if answered != stream {
        return Err(Error::new(
            ErrorCode::Comms,
            format!(
                "answer for stream {} received while waiting for stream {}",
                answered, stream
            ),
        ));
    }
    if !found {
        reader.finish()?;
        return Ok(None);
    }

    let class = reader.read_string()?;
    let structure = reader.read_string()?;
    let sample_bytes = usize::try_from(reader.read_u64()?)
        .map_err(|_| Error::new(ErrorCode::Comms, "sample size out of range"))?;
    let num = reader.read_u64()?;
    let den = reader.read_u64()?;
    reader.finish()?;

    let rate = SampleRate::new(num, den)
        .map_err(|e| Error::new(ErrorCode::Comms, e.message()).trace("in OUTPUTFOUND"))?;

    Ok(Some((
        DataSpec::new(class, sample_bytes).with_structure(structure),
        rate,
    )))
}

#[cfg(all(test, not(brahms_loom)))]
mod tests {
    use super::*;

    const PROGRESS: PassResult = PassResult {
        progress: true,
        finished: false,
    };
    const STUCK: PassResult = PassResult {
        progress: false,
        finished: false,
    };
    const DONE: PassResult = PassResult {
        progress: false,
        finished: true,
    };

    #[test]
    fn passes_rotate_between_voices() {
        let mut phase = ConnectPhase::new(1, 3);
        assert_eq!(phase.state(), ConnectState::RemotePass(0));
        phase.complete_pass(PROGRESS);
        assert_eq!(phase.state(), ConnectState::LocalPass(1));
        phase.complete_pass(DONE);
        assert_eq!(phase.state(), ConnectState::RemotePass(2));
        phase.complete_pass(DONE);
        assert_eq!(phase.state(), ConnectState::GlobalPassComplete);

        phase.advance();
        assert_eq!(phase.state(), ConnectState::RemotePass(0));
        assert_eq!(phase.global_passes(), 1);

        for result in [DONE, DONE, DONE] {
            phase.complete_pass(result);
        }
        phase.advance();
        assert_eq!(phase.state(), ConnectState::Finished);
        assert_eq!(phase.global_passes(), 2);
    }

    #[test]
    fn a_pass_without_progress_deadlocks() {
        let mut phase = ConnectPhase::new(0, 1);
        assert_eq!(phase.state(), ConnectState::LocalPass(0));
        phase.complete_pass(STUCK);
        phase.advance();
        assert_eq!(phase.state(), ConnectState::Deadlocked);
        assert_eq!(phase.global_passes(), 1);
    }

    #[test]
    fn progress_and_finished_accumulate() {
        let mut phase = ConnectPhase::new(0, 2);
        phase.complete_pass(DONE);
        phase.complete_pass(STUCK);
        phase.advance();
        assert_eq!(phase.state(), ConnectState::Deadlocked);

        let mut phase = ConnectPhase::new(0, 2);
        phase.complete_pass(DONE);
        phase.complete_pass(PROGRESS);
        phase.advance();
        assert_eq!(phase.state(), ConnectState::LocalPass(0));
    }

    #[test]
    fn pass_result_survives_the_wire() {
        let pool = crate::ipm::IpmPool::new(0);
        let mut ipm = pool.get(Tag::EndPhase);
        ipm.append_bytes(&PROGRESS.encode());
        assert_eq!(PassResult::decode(&ipm).unwrap(), PROGRESS);

        let mut bad = pool.get(Tag::EndPhase);
        bad.append_bytes(&[2, 0]);
        assert_eq!(PassResult::decode(&bad).unwrap_err().code(), ErrorCode::Comms);
    }
}

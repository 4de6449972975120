//! Supplicant side of the 4-Way and Group-Key handshakes,
//! IEEE 802.11-2016, 12.7.6 and 12.7.7.

use tracing::{debug, warn};

use crate::frame::{key_info, KeyFrame, KeyInfo};
use crate::handshake::Handshake;
use crate::keydata::{self, KeyData};
use crate::{HandshakeFailure, Result, Update, UpdateSink, RETRANSMIT_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitMsg1,
    AwaitMsg3,
    Complete,
    Failed,
}

pub struct Supplicant {
    hs: Handshake,
    state: State,
    /// Highest replay counter accepted from the authenticator.
    last_accepted: Option<u64>,
    /// Replay counter of the accepted Msg1, for idempotent Msg2 resends.
    msg1_replay: Option<u64>,
    /// Replay counter of the accepted Msg3, for idempotent Msg4 resends.
    msg3_replay: Option<u64>,
    /// Replay counter of the last accepted group-key Msg1.
    group_replay: Option<u64>,
    retries: u8,
}

impl Supplicant {
    /// Requires a handshake populated with the PMK, our RSNE and the
    /// BSS-advertised RSNE.
    pub fn new(hs: Handshake) -> Result<Supplicant> {
        if !hs.pmk_set() {
            return Err(crate::EapolError::Incomplete("PMK"));
        }
        if hs.own_ie().is_none() || hs.ap_ie().is_none() {
            return Err(crate::EapolError::Incomplete("negotiated IEs"));
        }
        hs.mic_algorithm()?;

        Ok(Supplicant {
            hs,
            state: State::AwaitMsg1,
            last_accepted: None,
            msg1_replay: None,
            msg3_replay: None,
            group_replay: None,
            retries: 0,
        })
    }

    /// Wraps a ladder whose PTK was installed outside the 4-Way
    /// Handshake (fast transition). Only group-key handshakes are
    /// serviced from here on.
    pub fn new_established(hs: Handshake) -> Result<Supplicant> {
        if !hs.ptk_complete() {
            return Err(crate::EapolError::Incomplete("an installed PTK"));
        }
        Ok(Supplicant {
            hs,
            state: State::Complete,
            last_accepted: None,
            msg1_replay: None,
            msg3_replay: None,
            group_replay: None,
            retries: 0,
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.hs
    }

    pub fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.hs
    }

    pub fn into_handshake(self) -> Handshake {
        self.hs
    }

    /// The kernel's rekey offload advanced the replay counter on our
    /// behalf; track it so a later in-band frame is not mistaken for a
    /// replay.
    pub fn note_offload_replay(&mut self, replay_counter: u64) {
        if Some(replay_counter) > self.last_accepted {
            self.last_accepted = Some(replay_counter);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Feeds one received EAPoL-Key frame into the machine.
    pub fn on_eapol_frame(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state == State::Failed {
            return;
        }

        let info = frame.key_info;
        if info.pairwise() {
            if info.ack() && !info.install() {
                self.on_msg1(frame, sink);
            } else if info.ack() && info.install() {
                self.on_msg3(frame, sink);
            } else {
                debug!("dropping unexpected pairwise EAPoL-Key frame");
            }
        } else if info.ack() {
            self.on_group_msg1(frame, sink);
        } else {
            debug!("dropping unexpected group EAPoL-Key frame");
        }
    }

    /// The retransmit timer fired while waiting for the authenticator.
    pub fn on_timeout(&mut self, sink: &mut UpdateSink) {
        if self.state != State::AwaitMsg3 {
            return;
        }
        if self.retries >= RETRANSMIT_LIMIT {
            self.fail(HandshakeFailure::Timeout, sink);
            return;
        }
        self.retries += 1;
        if let Some(replay) = self.msg1_replay {
            match self.build_msg2(replay) {
                Ok(msg2) => {
                    sink.push(Update::TxFrame(msg2));
                    sink.push(Update::StartTimer);
                }
                Err(err) => {
                    warn!("failed to rebuild Msg2 for retransmit: {err}");
                    self.fail(HandshakeFailure::Timeout, sink);
                }
            }
        }
    }

    fn fail(&mut self, failure: HandshakeFailure, sink: &mut UpdateSink) {
        self.state = State::Failed;
        self.hs.secure_erase();
        sink.push(Update::StopTimer);
        sink.push(Update::Failed(failure));
    }

    fn on_msg1(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        // 12.7.2: Msg1 has Ack set and neither MIC nor Install. A zeroed
        // nonce is never valid.
        if frame.key_info.mic() || frame.key_info.secure() || frame.nonce_is_zero() {
            debug!("dropping malformed Msg1");
            return;
        }

        match self.state {
            State::AwaitMsg1 => {}
            State::AwaitMsg3 => {
                // Retransmitted Msg1: answer idempotently; a counter that
                // moved on means the authenticator restarted, so start
                // over with the same SNonce but the new ANonce.
                if Some(frame.replay_counter) == self.msg1_replay {
                    if let Ok(msg2) = self.build_msg2(frame.replay_counter) {
                        sink.push(Update::TxFrame(msg2));
                    }
                    return;
                }
                if Some(frame.replay_counter) <= self.last_accepted {
                    debug!("dropping replayed Msg1");
                    return;
                }
            }
            // After PTK installation a new pairwise Msg1 would begin a
            // rekey; with the ladder frozen we let the offload (or a full
            // reconnect) handle that instead of reinstalling nonces.
            State::Complete | State::Failed => return,
        }

        if self.hs.set_anonce(frame.key_nonce).is_err() {
            return;
        }
        if self.hs.snonce().is_none() && self.hs.new_snonce().is_err() {
            return;
        }
        if let Err(err) = self.hs.derive_ptk() {
            warn!("PTK derivation failed: {err}");
            return;
        }

        match self.build_msg2(frame.replay_counter) {
            Ok(msg2) => {
                self.last_accepted = Some(frame.replay_counter);
                self.msg1_replay = Some(frame.replay_counter);
                self.state = State::AwaitMsg3;
                self.retries = 0;
                sink.push(Update::TxFrame(msg2));
                sink.push(Update::StartTimer);
            }
            Err(err) => warn!("failed to build Msg2: {err}"),
        }
    }

    fn build_msg2(&self, replay_counter: u64) -> Result<Vec<u8>> {
        let snonce = self.hs.snonce().ok_or(crate::EapolError::Incomplete("SNonce"))?;

        let mut key_data =
            self.hs.own_ie().ok_or(crate::EapolError::Incomplete("own RSNE"))?.to_vec();
        // An FT initial mobility-domain association repeats the MDE and
        // FTE after the RSNE, 12.7.6.3.
        if let Some(mde) = self.hs.mde() {
            key_data.extend_from_slice(mde);
            if let Some(fte) = self.hs.fte() {
                key_data.extend_from_slice(fte);
            }
        }

        let mut msg2 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version()?)
                .with(key_info::PAIRWISE | key_info::MIC),
            replay_counter,
            key_nonce: *snonce,
            key_data,
            ..KeyFrame::default()
        };
        let ptk = self.hs.ptk().ok_or(crate::EapolError::Incomplete("PTK"))?;
        msg2.sign(self.hs.mic_algorithm()?, ptk.kck())?;
        Ok(msg2.to_bytes())
    }

    fn build_msg4(&self, replay_counter: u64) -> Result<Vec<u8>> {
        let mut msg4 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version()?)
                .with(key_info::PAIRWISE | key_info::MIC | key_info::SECURE),
            replay_counter,
            ..KeyFrame::default()
        };
        let ptk = self.hs.ptk().ok_or(crate::EapolError::Incomplete("PTK"))?;
        msg4.sign(self.hs.mic_algorithm()?, ptk.kck())?;
        Ok(msg4.to_bytes())
    }

    fn on_msg3(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        // Retransmit of the accepted Msg3: acknowledge again, reinstall
        // nothing.
        if self.state == State::Complete {
            if Some(frame.replay_counter) == self.msg3_replay {
                if let Ok(msg4) = self.build_msg4(frame.replay_counter) {
                    sink.push(Update::TxFrame(msg4));
                }
            } else {
                debug!("dropping Msg3 after completion");
            }
            return;
        }
        if self.state != State::AwaitMsg3 {
            debug!("dropping Msg3 before Msg1");
            return;
        }
        if Some(frame.replay_counter) <= self.last_accepted {
            debug!("dropping Msg3 with stale replay counter");
            return;
        }

        // 12.7.6.4: Install, MIC, Secure and Encrypted Key Data are all
        // required; the nonce must repeat Msg1's ANonce.
        if !frame.key_info.install()
            || !frame.key_info.mic()
            || !frame.key_info.secure()
            || !frame.key_info.encrypted_key_data()
            || frame.key_data.is_empty()
        {
            debug!("dropping malformed Msg3");
            return;
        }
        if self.hs.anonce() != Some(&frame.key_nonce) {
            debug!("dropping Msg3 with unexpected ANonce");
            return;
        }

        let (kck, kek) = match self.hs.ptk() {
            Some(ptk) => (ptk.kck().to_vec(), ptk.kek().to_vec()),
            None => return,
        };
        let Ok(algorithm) = self.hs.mic_algorithm() else { return };
        match frame.verify_mic(algorithm, &kck) {
            Ok(true) => {}
            Ok(false) => {
                self.fail(HandshakeFailure::MicMismatch, sink);
                return;
            }
            Err(_) => return,
        }

        let plain = match keydata::decrypt(&kek, &frame.key_data) {
            Ok(plain) => plain,
            Err(err) => {
                warn!("Msg3 key data decryption failed: {err}");
                self.fail(HandshakeFailure::BadKeyData, sink);
                return;
            }
        };
        let key_data = match KeyData::parse(&plain) {
            Ok(kd) => kd,
            Err(err) => {
                warn!("Msg3 key data malformed: {err}");
                self.fail(HandshakeFailure::BadKeyData, sink);
                return;
            }
        };

        // The RSNE inside Msg3 must match the one the BSS advertised;
        // only the PMKID list may differ, 12.7.6.4.
        let matches = match (&key_data.rsne, self.hs.ap_ie()) {
            (Some(msg3_rsne), Some(ap_ie)) => {
                airlock_ie::rsne::ap_ie_matches(msg3_rsne, ap_ie, true)
            }
            _ => false,
        };
        if !matches {
            self.fail(HandshakeFailure::IeMismatch, sink);
            return;
        }

        let Some(gtk) = key_data.gtk else {
            self.fail(HandshakeFailure::BadKeyData, sink);
            return;
        };
        if self.hs.mfp() && key_data.igtk.is_none() {
            self.fail(HandshakeFailure::BadKeyData, sink);
            return;
        }

        let msg4 = match self.build_msg4(frame.replay_counter) {
            Ok(msg4) => msg4,
            Err(err) => {
                warn!("failed to build Msg4: {err}");
                return;
            }
        };

        self.last_accepted = Some(frame.replay_counter);
        self.msg3_replay = Some(frame.replay_counter);
        self.retries = 0;
        sink.push(Update::StopTimer);
        sink.push(Update::TxFrame(msg4));

        // Key installation order: pairwise first, then group keys.
        let cipher = self.hs.pairwise_cipher().expect("negotiated before Msg1");
        sink.push(Update::NewPtk {
            tk: self.hs.ptk().expect("derived at Msg1").tk().to_vec(),
            cipher_selector: cipher.to_cipher_selector(),
        });
        self.hs.install_gtk(gtk.key_id, &gtk.key, frame.key_rsc);
        let group_selector = self
            .hs
            .group_cipher()
            .unwrap_or(airlock_ie::CipherSuite::Ccmp)
            .to_cipher_selector();
        sink.push(Update::NewGtk {
            index: gtk.key_id,
            key: gtk.key,
            rsc: frame.key_rsc,
            cipher_selector: group_selector,
        });
        if let Some(igtk) = key_data.igtk {
            self.hs.install_igtk(igtk.key_id, &igtk.key, igtk.ipn);
            sink.push(Update::NewIgtk { index: igtk.key_id, key: igtk.key, ipn: igtk.ipn });
        }

        if self.hs.install_ptk().is_ok() {
            self.state = State::Complete;
            sink.push(Update::Complete);
        }
    }

    fn on_group_msg1(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state != State::Complete {
            debug!("dropping group key frame before RSNA establishment");
            return;
        }

        // Idempotent acknowledgement of a retransmit.
        if Some(frame.replay_counter) == self.group_replay {
            if let Ok(msg2) = self.build_group_msg2(frame.replay_counter) {
                sink.push(Update::TxFrame(msg2));
            }
            return;
        }
        if Some(frame.replay_counter) <= self.last_accepted {
            debug!("dropping replayed group key frame");
            return;
        }
        if !frame.key_info.mic()
            || !frame.key_info.secure()
            || !frame.key_info.encrypted_key_data()
        {
            debug!("dropping malformed group key frame");
            return;
        }

        let (kck, kek) = match self.hs.ptk() {
            Some(ptk) => (ptk.kck().to_vec(), ptk.kek().to_vec()),
            None => return,
        };
        let Ok(algorithm) = self.hs.mic_algorithm() else { return };
        match frame.verify_mic(algorithm, &kck) {
            Ok(true) => {}
            _ => {
                debug!("dropping group key frame with bad MIC");
                return;
            }
        }

        let Ok(plain) = keydata::decrypt(&kek, &frame.key_data) else {
            debug!("group key data decryption failed");
            return;
        };
        let Ok(key_data) = KeyData::parse(&plain) else { return };
        let Some(gtk) = key_data.gtk else {
            debug!("group key frame without GTK KDE");
            return;
        };

        let msg2 = match self.build_group_msg2(frame.replay_counter) {
            Ok(msg2) => msg2,
            Err(err) => {
                warn!("failed to build group Msg2: {err}");
                return;
            }
        };

        self.last_accepted = Some(frame.replay_counter);
        self.group_replay = Some(frame.replay_counter);
        sink.push(Update::TxFrame(msg2));

        self.hs.install_gtk(gtk.key_id, &gtk.key, frame.key_rsc);
        let group_selector = self
            .hs
            .group_cipher()
            .unwrap_or(airlock_ie::CipherSuite::Ccmp)
            .to_cipher_selector();
        sink.push(Update::NewGtk {
            index: gtk.key_id,
            key: gtk.key,
            rsc: frame.key_rsc,
            cipher_selector: group_selector,
        });
        if let Some(igtk) = key_data.igtk {
            self.hs.install_igtk(igtk.key_id, &igtk.key, igtk.ipn);
            sink.push(Update::NewIgtk { index: igtk.key_id, key: igtk.key, ipn: igtk.ipn });
        }
    }

    fn build_group_msg2(&self, replay_counter: u64) -> Result<Vec<u8>> {
        let mut msg2 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version()?)
                .with(key_info::MIC | key_info::SECURE),
            replay_counter,
            ..KeyFrame::default()
        };
        let ptk = self.hs.ptk().ok_or(crate::EapolError::Incomplete("PTK"))?;
        msg2.sign(self.hs.mic_algorithm()?, ptk.kck())?;
        Ok(msg2.to_bytes())
    }
}

impl std::fmt::Debug for Supplicant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supplicant").field("state", &self.state).finish()
    }
}

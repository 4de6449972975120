//! Authenticator side of the 4-Way and Group-Key handshakes, used by the
//! soft-AP path.
//!
//! The GTK is BSS-wide state owned by the AP; the authenticator only
//! wraps it into Msg3 (or a group-key Msg1) and reports the completed PTK
//! for the one station it serves.

use tracing::{debug, warn};

use crate::frame::{key_info, KeyFrame, KeyInfo};
use crate::handshake::{GroupKey, Handshake, IntegrityGroupKey};
use crate::keydata::{self, KeyDataBuilder};
use crate::{HandshakeFailure, Result, Update, UpdateSink, RETRANSMIT_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitMsg2,
    AwaitMsg4,
    Complete,
    AwaitGroupMsg2,
    Failed,
}

pub struct Authenticator {
    hs: Handshake,
    state: State,
    gtk: GroupKey,
    igtk: Option<IntegrityGroupKey>,
    /// Counter of the last frame we sent; the peer echoes it.
    replay_counter: u64,
    retries: u8,
    last_tx: Option<Vec<u8>>,
}

impl Authenticator {
    /// `hs` carries the station's association-request RSNE as the own-IE
    /// and our advertised RSNE as the AP-IE.
    pub fn new(hs: Handshake, gtk: GroupKey, igtk: Option<IntegrityGroupKey>) -> Result<Self> {
        if !hs.pmk_set() {
            return Err(crate::EapolError::Incomplete("PMK"));
        }
        if hs.own_ie().is_none() || hs.ap_ie().is_none() {
            return Err(crate::EapolError::Incomplete("negotiated IEs"));
        }
        hs.mic_algorithm()?;

        Ok(Authenticator {
            hs,
            state: State::Idle,
            gtk,
            igtk,
            replay_counter: 0,
            retries: 0,
            last_tx: None,
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.hs
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete | State::AwaitGroupMsg2)
    }

    /// Kicks off the 4-Way Handshake by sending Msg1. Also used to
    /// restart after an EAPoL-Start from the station.
    pub fn initiate(&mut self, sink: &mut UpdateSink) {
        if self.state == State::Failed || self.hs.ptk_complete() {
            return;
        }
        if self.hs.new_anonce().is_err() {
            return;
        }

        let anonce = *self.hs.anonce().expect("just generated");
        self.replay_counter += 1;
        let msg1 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version().expect("validated in new"))
                .with(key_info::PAIRWISE | key_info::ACK),
            key_length: self.hs.pairwise_cipher().map(|c| c.key_len() as u16).unwrap_or(16),
            replay_counter: self.replay_counter,
            key_nonce: anonce,
            ..KeyFrame::default()
        };

        let bytes = msg1.to_bytes();
        self.last_tx = Some(bytes.clone());
        self.state = State::AwaitMsg2;
        self.retries = 0;
        sink.push(Update::TxFrame(bytes));
        sink.push(Update::StartTimer);
    }

    /// Starts a group-key handshake delivering a fresh GTK after the
    /// initial RSNA is up.
    pub fn initiate_group_rekey(
        &mut self,
        gtk: GroupKey,
        igtk: Option<IntegrityGroupKey>,
        sink: &mut UpdateSink,
    ) {
        if self.state != State::Complete {
            return;
        }
        self.gtk = gtk;
        self.igtk = igtk;

        let frame = match self.build_group_msg1() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to build group rekey Msg1: {err}");
                return;
            }
        };
        self.last_tx = Some(frame.clone());
        self.state = State::AwaitGroupMsg2;
        self.retries = 0;
        sink.push(Update::TxFrame(frame));
        sink.push(Update::StartTimer);
    }

    pub fn on_eapol_frame(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state == State::Failed {
            return;
        }
        let info = frame.key_info;
        if info.ack() {
            debug!("dropping EAPoL-Key frame with Ack from a supplicant");
            return;
        }
        if info.pairwise() && !info.secure() {
            self.on_msg2(frame, sink);
        } else if info.pairwise() {
            self.on_msg4(frame, sink);
        } else {
            self.on_group_msg2(frame, sink);
        }
    }

    pub fn on_timeout(&mut self, sink: &mut UpdateSink) {
        if !matches!(self.state, State::AwaitMsg2 | State::AwaitMsg4 | State::AwaitGroupMsg2) {
            return;
        }
        if self.retries >= RETRANSMIT_LIMIT {
            self.fail(HandshakeFailure::Timeout, sink);
            return;
        }
        self.retries += 1;
        if let Some(frame) = &self.last_tx {
            sink.push(Update::TxFrame(frame.clone()));
            sink.push(Update::StartTimer);
        }
    }

    fn fail(&mut self, failure: HandshakeFailure, sink: &mut UpdateSink) {
        self.state = State::Failed;
        self.hs.secure_erase();
        sink.push(Update::StopTimer);
        sink.push(Update::Failed(failure));
    }

    fn on_msg2(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state != State::AwaitMsg2 {
            debug!("dropping unexpected Msg2");
            return;
        }
        if frame.replay_counter != self.replay_counter {
            debug!("dropping Msg2 with wrong replay counter");
            return;
        }
        if !frame.key_info.mic() || frame.nonce_is_zero() {
            debug!("dropping malformed Msg2");
            return;
        }

        if self.hs.set_snonce(frame.key_nonce).is_err() {
            return;
        }
        if let Err(err) = self.hs.derive_ptk() {
            warn!("PTK derivation failed: {err}");
            return;
        }

        let kck = self.hs.ptk().expect("just derived").kck().to_vec();
        let Ok(algorithm) = self.hs.mic_algorithm() else { return };
        match frame.verify_mic(algorithm, &kck) {
            Ok(true) => {}
            // A bad MIC here usually means the peer has the wrong PSK.
            // Drop and let the retransmit limit conclude the attempt.
            _ => {
                debug!("dropping Msg2 with invalid MIC");
                return;
            }
        }

        // 12.7.6.3: the RSNE in Msg2 must be bit-wise identical to the
        // one from the (re)association request.
        let sent_rsne = airlock_ie::tlv::find_unique_raw(&frame.key_data, airlock_ie::eid::RSN);
        let matches = match (sent_rsne, self.hs.own_ie()) {
            (Ok(Some(rsne)), Some(own)) => rsne == own,
            _ => false,
        };
        if !matches {
            self.fail(HandshakeFailure::IeMismatch, sink);
            return;
        }

        let msg3 = match self.build_msg3() {
            Ok(msg3) => msg3,
            Err(err) => {
                warn!("failed to build Msg3: {err}");
                return;
            }
        };
        self.last_tx = Some(msg3.clone());
        self.state = State::AwaitMsg4;
        self.retries = 0;
        sink.push(Update::TxFrame(msg3));
        sink.push(Update::StartTimer);
    }

    fn build_msg3(&mut self) -> Result<Vec<u8>> {
        let anonce = *self.hs.anonce().ok_or(crate::EapolError::Incomplete("ANonce"))?;
        let ap_ie = self.hs.ap_ie().ok_or(crate::EapolError::Incomplete("AP RSNE"))?;

        let mut builder =
            KeyDataBuilder::default().rsne(ap_ie).gtk(self.gtk.index, true, &self.gtk.key);
        if let Some(igtk) = &self.igtk {
            builder = builder.igtk(igtk.index, &igtk.ipn, &igtk.key);
        }
        let ptk = self.hs.ptk().ok_or(crate::EapolError::Incomplete("PTK"))?;
        let key_data = keydata::encrypt(ptk.kek(), &builder.build())?;

        self.replay_counter += 1;
        let mut msg3 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version()?).with(
                key_info::PAIRWISE
                    | key_info::ACK
                    | key_info::MIC
                    | key_info::INSTALL
                    | key_info::SECURE
                    | key_info::ENCRYPTED_KEY_DATA,
            ),
            key_length: self.hs.pairwise_cipher().map(|c| c.key_len() as u16).unwrap_or(16),
            replay_counter: self.replay_counter,
            key_nonce: anonce,
            key_rsc: self.gtk.rsc,
            key_data,
            ..KeyFrame::default()
        };
        msg3.sign(self.hs.mic_algorithm()?, ptk.kck())?;
        Ok(msg3.to_bytes())
    }

    fn on_msg4(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state != State::AwaitMsg4 {
            debug!("dropping unexpected Msg4");
            return;
        }
        if frame.replay_counter != self.replay_counter {
            debug!("dropping Msg4 with wrong replay counter");
            return;
        }
        if !frame.key_info.mic() || !frame.key_info.secure() {
            debug!("dropping malformed Msg4");
            return;
        }

        let kck = match self.hs.ptk() {
            Some(ptk) => ptk.kck().to_vec(),
            None => return,
        };
        let Ok(algorithm) = self.hs.mic_algorithm() else { return };
        match frame.verify_mic(algorithm, &kck) {
            Ok(true) => {}
            _ => {
                debug!("dropping Msg4 with invalid MIC");
                return;
            }
        }

        sink.push(Update::StopTimer);
        let cipher = self.hs.pairwise_cipher().expect("negotiated before initiate");
        sink.push(Update::NewPtk {
            tk: self.hs.ptk().expect("derived at Msg2").tk().to_vec(),
            cipher_selector: cipher.to_cipher_selector(),
        });
        if self.hs.install_ptk().is_ok() {
            self.state = State::Complete;
            sink.push(Update::Complete);
        }
    }

    fn build_group_msg1(&mut self) -> Result<Vec<u8>> {
        let mut builder = KeyDataBuilder::default().gtk(self.gtk.index, true, &self.gtk.key);
        if let Some(igtk) = &self.igtk {
            builder = builder.igtk(igtk.index, &igtk.ipn, &igtk.key);
        }
        let ptk = self.hs.ptk().ok_or(crate::EapolError::Incomplete("PTK"))?;
        let key_data = keydata::encrypt(ptk.kek(), &builder.build())?;

        self.replay_counter += 1;
        let mut msg1 = KeyFrame {
            key_info: KeyInfo(self.hs.descriptor_version()?).with(
                key_info::ACK | key_info::MIC | key_info::SECURE | key_info::ENCRYPTED_KEY_DATA,
            ),
            replay_counter: self.replay_counter,
            key_rsc: self.gtk.rsc,
            key_data,
            ..KeyFrame::default()
        };
        msg1.sign(self.hs.mic_algorithm()?, ptk.kck())?;
        Ok(msg1.to_bytes())
    }

    fn on_group_msg2(&mut self, frame: &KeyFrame, sink: &mut UpdateSink) {
        if self.state != State::AwaitGroupMsg2 {
            debug!("dropping unexpected group Msg2");
            return;
        }
        if frame.replay_counter != self.replay_counter
            || !frame.key_info.mic()
            || !frame.key_info.secure()
        {
            debug!("dropping malformed group Msg2");
            return;
        }

        let kck = match self.hs.ptk() {
            Some(ptk) => ptk.kck().to_vec(),
            None => return,
        };
        let Ok(algorithm) = self.hs.mic_algorithm() else { return };
        match frame.verify_mic(algorithm, &kck) {
            Ok(true) => {}
            _ => return,
        }

        self.state = State::Complete;
        sink.push(Update::StopTimer);
        sink.push(Update::Complete);
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("state", &self.state)
            .field("replay_counter", &self.replay_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeConfig;
    use crate::supplicant::Supplicant;
    use airlock_ie::Rsne;

    const SPA: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const AA: [u8; 6] = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
    const PMK: [u8; 32] = [0x42; 32];

    fn handshake(own_ie: &[u8], ap_ie: &[u8]) -> Handshake {
        let mut hs = Handshake::new(HandshakeConfig { spa: SPA, aa: AA, ssid: b"Net".to_vec() });
        hs.set_own_ie(own_ie).unwrap();
        hs.set_ap_ie(ap_ie).unwrap();
        hs.set_pmk(PMK).unwrap();
        hs
    }

    fn pair() -> (Authenticator, Supplicant) {
        let rsne = Rsne::wpa2_psk().to_bytes();
        let auth = Authenticator::new(
            handshake(&rsne, &rsne),
            GroupKey { index: 1, key: vec![0xaa; 16], rsc: 0 },
            None,
        )
        .unwrap();
        let supp = Supplicant::new(handshake(&rsne, &rsne)).unwrap();
        (auth, supp)
    }

    fn take_frames(sink: &mut UpdateSink) -> Vec<KeyFrame> {
        let frames = sink
            .iter()
            .filter_map(|u| match u {
                Update::TxFrame(bytes) => Some(KeyFrame::parse(bytes).unwrap()),
                _ => None,
            })
            .collect();
        sink.clear();
        frames
    }

    fn run_fourway(auth: &mut Authenticator, supp: &mut Supplicant) -> (UpdateSink, UpdateSink) {
        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();

        auth.initiate(&mut a_sink);
        let msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg1, &mut s_sink);
        let msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&msg2, &mut a_sink);
        let msg3 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg3, &mut s_sink);
        let msg4 = s_sink
            .iter()
            .find_map(|u| match u {
                Update::TxFrame(bytes) => Some(KeyFrame::parse(bytes).unwrap()),
                _ => None,
            })
            .expect("Msg4 transmitted");
        auth.on_eapol_frame(&msg4, &mut a_sink);
        (a_sink, s_sink)
    }

    #[test]
    fn full_fourway_derives_matching_keys() {
        let (mut auth, mut supp) = pair();
        let (a_sink, s_sink) = run_fourway(&mut auth, &mut supp);

        assert!(supp.is_complete());
        assert!(auth.is_complete());

        let s_tk = s_sink.iter().find_map(|u| match u {
            Update::NewPtk { tk, .. } => Some(tk.clone()),
            _ => None,
        });
        let a_tk = a_sink.iter().find_map(|u| match u {
            Update::NewPtk { tk, .. } => Some(tk.clone()),
            _ => None,
        });
        assert_eq!(s_tk, a_tk);
        assert!(s_tk.is_some());

        // The supplicant also picked up the authenticator's GTK.
        let s_gtk = s_sink.iter().find_map(|u| match u {
            Update::NewGtk { key, index, .. } => Some((key.clone(), *index)),
            _ => None,
        });
        assert_eq!(s_gtk, Some((vec![0xaa; 16], 1)));
    }

    #[test]
    fn msg3_retransmit_is_idempotent() {
        let (mut auth, mut supp) = pair();

        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();
        auth.initiate(&mut a_sink);
        let msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg1, &mut s_sink);
        let msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&msg2, &mut a_sink);
        let msg3 = take_frames(&mut a_sink).remove(0);

        supp.on_eapol_frame(&msg3, &mut s_sink);
        assert!(s_sink.iter().any(|u| matches!(u, Update::NewPtk { .. })));
        s_sink.clear();

        // Same replay counter again: Msg4 is retransmitted, keys are not.
        supp.on_eapol_frame(&msg3, &mut s_sink);
        assert_eq!(s_sink.iter().filter(|u| matches!(u, Update::TxFrame(_))).count(), 1);
        assert!(!s_sink.iter().any(|u| matches!(u, Update::NewPtk { .. })));
        assert!(!s_sink.iter().any(|u| matches!(u, Update::NewGtk { .. })));
    }

    #[test]
    fn msg3_with_changed_rsne_fails_ie_mismatch() {
        let rsne = Rsne::wpa2_psk().to_bytes();
        let mut tkip = Rsne::wpa2_psk();
        tkip.pairwise_ciphers = airlock_ie::CipherSuite::Tkip as u16;
        let tkip_bytes = tkip.to_bytes();

        // The authenticator advertises TKIP in Msg3 while the supplicant
        // negotiated against a CCMP beacon.
        let mut auth = Authenticator::new(
            handshake(&rsne, &tkip_bytes),
            GroupKey { index: 1, key: vec![0xaa; 16], rsc: 0 },
            None,
        )
        .unwrap();
        let mut supp = Supplicant::new(handshake(&rsne, &rsne)).unwrap();

        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();
        auth.initiate(&mut a_sink);
        let msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg1, &mut s_sink);
        let msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&msg2, &mut a_sink);
        let msg3 = take_frames(&mut a_sink).remove(0);

        supp.on_eapol_frame(&msg3, &mut s_sink);
        assert!(s_sink.contains(&Update::Failed(HandshakeFailure::IeMismatch)));
        assert!(!s_sink.iter().any(|u| matches!(u, Update::NewPtk { .. })));
    }

    #[test]
    fn stale_replay_counter_dropped() {
        let (mut auth, mut supp) = pair();
        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();

        auth.initiate(&mut a_sink);
        let msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg1, &mut s_sink);
        let msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&msg2, &mut a_sink);
        let mut msg3 = take_frames(&mut a_sink).remove(0);

        // Rewind the counter below the accepted Msg1 counter.
        msg3.replay_counter = 0;
        supp.on_eapol_frame(&msg3, &mut s_sink);
        assert!(s_sink.is_empty(), "stale frame must be ignored silently");
    }

    #[test]
    fn authenticator_rejects_msg2_rsne_change() {
        let rsne = Rsne::wpa2_psk().to_bytes();
        let mut other = Rsne::wpa2_psk();
        other.pmkids.push([9; 16]);
        let other_bytes = other.to_bytes();

        // Supplicant puts a different RSNE into Msg2 than the one from
        // the association request.
        let mut auth = Authenticator::new(
            handshake(&rsne, &rsne),
            GroupKey { index: 1, key: vec![0xaa; 16], rsc: 0 },
            None,
        )
        .unwrap();
        let mut supp = Supplicant::new(handshake(&other_bytes, &rsne)).unwrap();

        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();
        auth.initiate(&mut a_sink);
        let msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&msg1, &mut s_sink);
        let msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&msg2, &mut a_sink);

        assert!(a_sink.contains(&Update::Failed(HandshakeFailure::IeMismatch)));
    }

    #[test]
    fn timeout_retries_then_fails() {
        let (mut auth, _supp) = pair();
        let mut sink = UpdateSink::new();
        auth.initiate(&mut sink);
        sink.clear();

        for _ in 0..RETRANSMIT_LIMIT {
            auth.on_timeout(&mut sink);
            assert!(sink.iter().any(|u| matches!(u, Update::TxFrame(_))));
            sink.clear();
        }
        auth.on_timeout(&mut sink);
        assert!(sink.contains(&Update::Failed(HandshakeFailure::Timeout)));
    }

    #[test]
    fn group_rekey_round_trip() {
        let (mut auth, mut supp) = pair();
        run_fourway(&mut auth, &mut supp);

        let mut a_sink = UpdateSink::new();
        let mut s_sink = UpdateSink::new();
        auth.initiate_group_rekey(
            GroupKey { index: 2, key: vec![0xbb; 16], rsc: 7 },
            None,
            &mut a_sink,
        );
        let group_msg1 = take_frames(&mut a_sink).remove(0);
        supp.on_eapol_frame(&group_msg1, &mut s_sink);

        let new_gtk = s_sink.iter().find_map(|u| match u {
            Update::NewGtk { index, key, rsc, .. } => Some((*index, key.clone(), *rsc)),
            _ => None,
        });
        assert_eq!(new_gtk, Some((2, vec![0xbb; 16], 7)));

        let group_msg2 = take_frames(&mut s_sink).remove(0);
        auth.on_eapol_frame(&group_msg2, &mut a_sink);
        assert!(a_sink.contains(&Update::Complete));

        // Replaying the rekey Msg1 re-acks without another install.
        s_sink.clear();
        supp.on_eapol_frame(&group_msg1, &mut s_sink);
        assert_eq!(s_sink.iter().filter(|u| matches!(u, Update::TxFrame(_))).count(), 1);
        assert!(!s_sink.iter().any(|u| matches!(u, Update::NewGtk { .. })));
    }
}

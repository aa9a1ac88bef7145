//! Per-connection admission state machine.
//!
//! The classifier owns the client-to-server direction until it reaches a
//! verdict: it watches the first packets of a connection, extracts an
//! identifying string (TLS SNI or a heuristic RDP client name), checks the
//! configured whitelists, and either admits the connection to the splice
//! engine or rejects it. Classification is CPU-only; reading the packets is
//! the caller's job.

use crate::rdp;
use rdpforward_config::Config;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The TPKT marker opening an RDP negotiation packet.
const RDP_TPKT: u8 = 0x03;

/// TLS handshake record content type.
const TLS_HANDSHAKE: u8 = 0x16;

/// Last client-to-server packet index inspected by the client-name
/// heuristic; one packet beyond it triggers the cutoff decision.
const INSPECTION_WINDOW: u64 = 5;

/// Classification stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing observed yet.
    AwaitingFirstPacket,
    /// Inspection window open: waiting for a TLS upgrade or a client name.
    AwaitingTls,
    /// Terminal: the splice engine owns the byte flow from here on.
    Admitted,
    /// Terminal: no further bytes pass in either direction.
    Rejected,
}

/// Outcome of observing one client-to-server packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the packet and keep inspecting.
    Continue,
    /// Forward the packet; inspection is over.
    Admitted,
    /// Drop the packet and tear the connection down.
    Rejected,
}

pub struct Classifier {
    config: Arc<Config>,
    stage: Stage,
    packet_index: u64,
    rdp_negotiated: bool,
    tls_detected: bool,
    client_identified: bool,
}

impl Classifier {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            stage: Stage::AwaitingFirstPacket,
            packet_index: 0,
            rdp_negotiated: false,
            tls_detected: false,
            client_identified: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// True once a terminal verdict has been reached; `observe` must not be
    /// called again after this returns true.
    pub fn is_settled(&self) -> bool {
        matches!(self.stage, Stage::Admitted | Stage::Rejected)
    }

    /// Consumes one client-to-server packet and advances the state machine.
    pub fn observe(&mut self, packet: &[u8]) -> Verdict {
        self.packet_index += 1;

        match self.stage {
            Stage::AwaitingFirstPacket => self.observe_first(packet),
            Stage::AwaitingTls => self.observe_awaiting_tls(packet),
            Stage::Admitted => Verdict::Admitted,
            Stage::Rejected => Verdict::Rejected,
        }
    }

    fn observe_first(&mut self, packet: &[u8]) -> Verdict {
        match packet.first() {
            Some(&TLS_HANDSHAKE) => self.on_tls_packet(packet),
            Some(&RDP_TPKT) => {
                debug!("→ RDP协议协商包 (等待TLS升级)");
                self.rdp_negotiated = true;
                self.stage = Stage::AwaitingTls;
                Verdict::Continue
            }
            _ => {
                // Opaque traffic: with no whitelist there is nothing to
                // check; otherwise keep the window open for identification.
                if self.unrestricted() {
                    self.admit()
                } else {
                    self.stage = Stage::AwaitingTls;
                    Verdict::Continue
                }
            }
        }
    }

    fn observe_awaiting_tls(&mut self, packet: &[u8]) -> Verdict {
        if packet.first() == Some(&TLS_HANDSHAKE) {
            return self.on_tls_packet(packet);
        }

        if (2..=INSPECTION_WINDOW).contains(&self.packet_index)
            && let Some(name) = rdp::extract_client_name(packet)
        {
            info!("[RDP客户端] {} (未加密连接)", name);
            self.client_identified = true;

            if !self.config.client_whitelist.is_empty() {
                if !self.config.client_whitelist.contains(&name) {
                    warn!("❌ RDP客户端名称不在白名单中，断开连接");
                    return self.reject();
                }
                debug!("✓ RDP客户端名称在白名单中");
            }
            return self.admit();
        }

        if self.packet_index > INSPECTION_WINDOW && !self.client_identified {
            if !self.config.sni_whitelist.is_empty() {
                warn!("❌ RDP协商后未检测到TLS升级，配置了SNI白名单要求TLS连接，断开连接");
                return self.reject();
            }
            if !self.config.client_whitelist.is_empty() {
                warn!("❌ 未能识别RDP客户端信息，配置了客户端白名单要求识别客户端，断开连接");
                return self.reject();
            }
            return self.admit();
        }

        Verdict::Continue
    }

    fn on_tls_packet(&mut self, packet: &[u8]) -> Verdict {
        debug!("✓ 检测到TLS握手包");
        self.tls_detected = true;

        match crate::extract_sni(packet) {
            Ok(Some(sni)) => {
                info!("[SNI] {}", sni);
                self.client_identified = true;

                if !self.config.sni_whitelist.is_empty() {
                    if !self.config.sni_whitelist.contains(&sni) {
                        warn!("❌ SNI不在白名单中，断开连接");
                        return self.reject();
                    }
                    debug!("✓ SNI在白名单中");
                }
                self.admit()
            }
            Ok(None) => {
                debug!("⚠ TLS但未能提取SNI");
                self.after_missing_sni()
            }
            Err(e) => {
                debug!("⚠ TLS但未能提取SNI: {}", e);
                self.after_missing_sni()
            }
        }
    }

    /// A TLS packet without a recoverable SNI admits an unrestricted
    /// connection; with an SNI whitelist configured the window stays open.
    fn after_missing_sni(&mut self) -> Verdict {
        if self.config.sni_whitelist.is_empty() {
            self.admit()
        } else {
            self.stage = Stage::AwaitingTls;
            Verdict::Continue
        }
    }

    fn unrestricted(&self) -> bool {
        self.config.sni_whitelist.is_empty() && self.config.client_whitelist.is_empty()
    }

    fn admit(&mut self) -> Verdict {
        self.stage = Stage::Admitted;
        Verdict::Admitted
    }

    fn reject(&mut self) -> Verdict {
        self.stage = Stage::Rejected;
        Verdict::Rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdpforward_config::Whitelist;

    fn config(sni: &[&str], clients: &[&str]) -> Arc<Config> {
        Arc::new(Config {
            target: "127.0.0.1:28820".to_string(),
            sni_whitelist: Whitelist::from_entries(sni.iter().copied()),
            client_whitelist: Whitelist::from_entries(clients.iter().copied()),
            ..Config::default()
        })
    }

    fn client_hello(domain: &str) -> Vec<u8> {
        let domain_bytes = domain.as_bytes();
        let domain_len = domain_bytes.len() as u16;
        let sni_list_len = 3 + domain_len;
        let sni_ext_len = 2 + sni_list_len;
        let extensions_len = 4 + sni_ext_len;
        let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
        let record_len = 4 + handshake_len;

        let mut record = vec![
            0x16,
            0x03,
            0x01,
            (record_len >> 8) as u8,
            (record_len & 0xff) as u8,
            0x01,
            ((handshake_len as u32) >> 16) as u8,
            (handshake_len >> 8) as u8,
            (handshake_len & 0xff) as u8,
            0x03,
            0x03,
        ];
        record.extend_from_slice(&[0; 32]);
        record.extend_from_slice(&[
            0x00,
            0x00,
            0x02,
            0x00,
            0x00,
            0x01,
            0x00,
            (extensions_len >> 8) as u8,
            (extensions_len & 0xff) as u8,
            0x00,
            0x00,
            (sni_ext_len >> 8) as u8,
            (sni_ext_len & 0xff) as u8,
            (sni_list_len >> 8) as u8,
            (sni_list_len & 0xff) as u8,
            0x00,
            (domain_len >> 8) as u8,
            (domain_len & 0xff) as u8,
        ]);
        record.extend_from_slice(domain_bytes);
        record
    }

    /// RDP negotiation request: TPKT + X.224 Connection Request prefix.
    fn rdp_negotiation() -> Vec<u8> {
        let mut packet = vec![0x03, 0x00, 0x00, 0x13, 0x0e, 0xe0, 0x00, 0x00];
        packet.resize(19, 0);
        packet
    }

    /// TPKT packet embedding `name` as UTF-16-LE at offset 120.
    fn connect_initial(name: &str) -> Vec<u8> {
        let mut packet = vec![0u8; 400];
        packet[0] = 0x03;
        packet[1] = 0x00;
        packet[2] = 0x01;
        packet[3] = 0x90;
        for (i, b) in name.bytes().enumerate() {
            packet[120 + i * 2] = b;
        }
        packet
    }

    #[test]
    fn test_tls_admit_on_whitelisted_sni() {
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&client_hello("a.example")), Verdict::Admitted);
        assert_eq!(classifier.stage(), Stage::Admitted);
    }

    #[test]
    fn test_tls_reject_on_unlisted_sni() {
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&client_hello("b.example")), Verdict::Rejected);
        assert_eq!(classifier.stage(), Stage::Rejected);
    }

    #[test]
    fn test_sni_match_is_case_sensitive() {
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&client_hello("A.Example")), Verdict::Rejected);
    }

    #[test]
    fn test_tls_admit_with_empty_whitelist() {
        let mut classifier = Classifier::new(config(&[], &[]));
        assert_eq!(classifier.observe(&client_hello("anything")), Verdict::Admitted);
    }

    #[test]
    fn test_tls_without_sni_admits_when_unrestricted() {
        // Handshake marker but nothing parseable behind it
        let mut packet = vec![0x16u8];
        packet.resize(10, 0);
        let mut classifier = Classifier::new(config(&[], &[]));
        assert_eq!(classifier.observe(&packet), Verdict::Admitted);
    }

    #[test]
    fn test_tls_without_sni_keeps_window_open_under_whitelist() {
        let mut packet = vec![0x16u8];
        packet.resize(10, 0);
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&packet), Verdict::Continue);
        assert_eq!(classifier.stage(), Stage::AwaitingTls);
    }

    #[test]
    fn test_rdp_negotiation_then_tls_upgrade() {
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        assert_eq!(classifier.stage(), Stage::AwaitingTls);
        assert_eq!(classifier.observe(&client_hello("a.example")), Verdict::Admitted);
    }

    #[test]
    fn test_plain_rdp_admit_via_client_whitelist() {
        let mut classifier = Classifier::new(config(&[], &["WORK-PC"]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        assert_eq!(classifier.observe(&connect_initial("WORK-PC")), Verdict::Admitted);
    }

    #[test]
    fn test_plain_rdp_reject_on_unlisted_client_name() {
        let mut classifier = Classifier::new(config(&[], &["WORK-PC"]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        assert_eq!(classifier.observe(&connect_initial("EVIL-PC")), Verdict::Rejected);
    }

    #[test]
    fn test_client_name_with_empty_whitelist_admits() {
        let mut classifier = Classifier::new(config(&[], &[]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        assert_eq!(classifier.observe(&connect_initial("ANY-PC")), Verdict::Admitted);
    }

    #[test]
    fn test_cutoff_rejects_with_sni_whitelist() {
        // Scenario: RDP negotiation, then packets with no TLS upgrade and no
        // recoverable name. Packet 6 crosses the window.
        let mut classifier = Classifier::new(config(&["x"], &[]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        for _ in 2..=5 {
            assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        }
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Rejected);
    }

    #[test]
    fn test_cutoff_rejects_with_client_whitelist() {
        let mut classifier = Classifier::new(config(&[], &["WORK-PC"]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        for _ in 2..=5 {
            assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        }
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Rejected);
    }

    #[test]
    fn test_cutoff_admits_when_unrestricted() {
        // An unrestricted connection with an opaque first packet admits
        // immediately, so drive one that opened the window via TPKT.
        let mut classifier = Classifier::new(config(&[], &[]));
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        for _ in 2..=5 {
            assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Continue);
        }
        assert_eq!(classifier.observe(&rdp_negotiation()), Verdict::Admitted);
    }

    #[test]
    fn test_open_forwarder_admits_any_first_packet() {
        let mut classifier = Classifier::new(config(&[], &[]));
        assert_eq!(classifier.observe(b"GET / HTTP/1.1\r\n"), Verdict::Admitted);
    }

    #[test]
    fn test_opaque_first_packet_keeps_window_open_under_whitelist() {
        let mut classifier = Classifier::new(config(&[], &["WORK-PC"]));
        assert_eq!(classifier.observe(b"\x00\x01\x02\x03"), Verdict::Continue);
        assert_eq!(classifier.stage(), Stage::AwaitingTls);
        // Identification can still happen inside the window
        assert_eq!(classifier.observe(&connect_initial("WORK-PC")), Verdict::Admitted);
    }

    #[test]
    fn test_empty_packet_with_whitelist_continues() {
        let mut classifier = Classifier::new(config(&["a.example"], &[]));
        assert_eq!(classifier.observe(&[]), Verdict::Continue);
    }
}

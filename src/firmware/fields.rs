//! Named fields of the active region.
//!
//! Network settings live twice: the running copy near the start of the region and a
//! factory-default copy 0x700 bytes further on. Setters write both.

use std::net::Ipv4Addr;

use super::{FirmwareImage, Kind};
use crate::transport::MacAddr;

pub const IP: usize = 0x04;
pub const NETMASK: usize = 0x08;
pub const GATEWAY: usize = 0x0c;
const DEFAULT_COPY: usize = 0x700;
pub const MAC: usize = 0x10;
const MAC_MIRROR: usize = 0x790;
pub const REVISION: usize = 0x16;
pub const PASSWORD_DIGEST: usize = 0x20;
pub const CNU_ID: usize = 0x50;
pub const EOC_TYPE: usize = 0x56;
pub const WEB_PASSWORD_DIGEST: usize = 0x780;

pub const MANAGE_VLAN: usize = 0x710;
pub const PRIO_VLANS: usize = 0x712;
pub const PRIO_IPS: usize = 0x71a;
pub const QOS_MODE: usize = 0x729;
pub const LLID_BINDING: usize = 0x762;
pub const ANTI_NOISE: usize = 0x763;
pub const DEFAULT_BAND: usize = 0x764;
pub const MODE: usize = 0x765;
pub const CLT_TX_POWER_OFFSET: usize = 0x768;
/// Priority buffer sizes, stored downwards from here.
pub const CLT_PRIO_BUF: usize = 0x76d;
pub const INET_BLOCK: usize = 0x803;
pub const VLAN_FLAGS: usize = 0x804;
pub const SPEED_LIMIT: usize = 0x805;
pub const VLAN_ID: usize = 0x809;
pub const CIR: usize = 0x80c;
pub const PORT_VLANS: usize = 0x810;
pub const MAC_LIMIT: usize = 0x818;
pub const USER_DESC: usize = 0x840;
pub const USER_DESC_LEN: usize = 0x40;

const PORTS: usize = 4;

/// One bit of a flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag {
    pub offset: usize,
    pub bit: u8,
}

impl Flag {
    pub const fn new(offset: usize, bit: u8) -> Self {
        Self { offset, bit }
    }
}

pub const VLAN_TAG: Flag = Flag::new(VLAN_FLAGS, 0);
pub const VLAN_UNTAG: Flag = Flag::new(VLAN_FLAGS, 1);
pub const PORT_VLAN: Flag = Flag::new(VLAN_FLAGS, 2);
pub const IGMP: Flag = Flag::new(VLAN_FLAGS, 3);

/// Boolean settings addressable by name.
pub const FLAGS: &[(&str, Flag)] = &[
    ("vlan-tag", VLAN_TAG),
    ("vlan-untag", VLAN_UNTAG),
    ("port-vlan", PORT_VLAN),
    ("igmp", IGMP),
    ("force-nic", Flag::new(0x766, 2)),
    ("simple-isolate", Flag::new(0x766, 3)),
    ("get-dev-mac", Flag::new(0x766, 4)),
    ("cnu-tx-power-auto", Flag::new(0x766, 5)),
    ("clt-high-sensitivity", Flag::new(0x766, 6)),
    ("clt-inverse-phy-clock", Flag::new(0x774, 0)),
    ("cnu-loop-detect", Flag::new(0x774, 1)),
    ("cnu-phy-cfg", Flag::new(0x774, 3)),
];

pub fn flag_by_name(name: &str) -> Option<Flag> {
    FLAGS.iter().find(|(n, _)| *n == name).map(|&(_, f)| f)
}

impl FirmwareImage {
    fn byte_at(&self, offset: usize) -> u8 {
        self.get(offset, 1)[0]
    }

    fn ipv4_at(&self, offset: usize) -> Ipv4Addr {
        let b = self.get(offset, 4);
        Ipv4Addr::new(b[0], b[1], b[2], b[3])
    }

    fn mac_at(&self, offset: usize) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(self.get(offset, 6));
        MacAddr(mac)
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.byte_at(flag.offset) & (1 << flag.bit) != 0
    }

    pub fn set_flag(&mut self, flag: Flag, on: bool) {
        let b = self.byte_at(flag.offset);
        let b = if on { b | (1 << flag.bit) } else { b & !(1 << flag.bit) };
        self.put(flag.offset, &[b]);
    }

    /* ---------- network ---------- */

    pub fn ip(&self) -> Ipv4Addr {
        self.ipv4_at(IP)
    }
    pub fn netmask(&self) -> Ipv4Addr {
        self.ipv4_at(NETMASK)
    }
    pub fn gateway(&self) -> Ipv4Addr {
        self.ipv4_at(GATEWAY)
    }
    /// Factory-default address.
    pub fn default_ip(&self) -> Ipv4Addr {
        self.ipv4_at(IP + DEFAULT_COPY)
    }

    pub fn set_ip(&mut self, ip: Ipv4Addr) {
        self.put_net(IP, ip);
    }
    pub fn set_netmask(&mut self, nm: Ipv4Addr) {
        self.put_net(NETMASK, nm);
    }
    pub fn set_gateway(&mut self, gw: Ipv4Addr) {
        self.put_net(GATEWAY, gw);
    }

    fn put_net(&mut self, offset: usize, addr: Ipv4Addr) {
        self.put(offset, &addr.octets());
        self.put(offset + DEFAULT_COPY, &addr.octets());
    }

    pub fn mac(&self) -> MacAddr {
        self.mac_at(MAC)
    }

    pub fn set_mac(&mut self, mac: MacAddr) {
        self.put(MAC, &mac.octets());
        self.put(MAC_MIRROR, &mac.octets());
    }

    /// Id stored inside the region, as opposed to the file head.
    pub fn stored_cnu_id(&self) -> MacAddr {
        self.mac_at(CNU_ID)
    }

    /* ---------- identity ---------- */

    pub fn revision(&self) -> u16 {
        self.get_short(REVISION)
    }

    pub fn set_revision(&mut self, rev: u16) {
        self.put(REVISION, &rev.to_be_bytes());
    }

    pub fn set_password_digest(&mut self, digest: &[u8; 16]) {
        self.put(PASSWORD_DIGEST, digest);
    }

    pub fn set_web_password_digest(&mut self, digest: &[u8; 16]) {
        self.put(WEB_PASSWORD_DIGEST, digest);
    }

    /// Role recorded in the region. 0xFF marks a CLT.
    pub fn eoc_type(&self) -> Kind {
        if self.byte_at(EOC_TYPE) == 0xff {
            Kind::Clt
        } else {
            Kind::Cnu
        }
    }

    pub fn set_eoc_type(&mut self, kind: Kind) {
        let v = match kind {
            Kind::Clt => 0xff,
            Kind::Cnu => 0x01,
        };
        self.put(EOC_TYPE, &[v]);
    }

    pub fn user_description(&self) -> String {
        self.get(USER_DESC, USER_DESC_LEN)
            .iter()
            .take_while(|&&b| b != 0 && b != 0xff)
            .map(|&b| b as char)
            .collect()
    }

    /// Truncated to 64 bytes, zero padded.
    pub fn set_user_description(&mut self, desc: &str) {
        let mut field = [0u8; USER_DESC_LEN];
        let n = desc.len().min(USER_DESC_LEN);
        field[..n].copy_from_slice(&desc.as_bytes()[..n]);
        self.put(USER_DESC, &field);
    }

    /* ---------- vlan ---------- */

    pub fn vlan_enabled(&self) -> bool {
        self.flag(VLAN_TAG) || self.flag(VLAN_UNTAG)
    }

    pub fn set_vlan_enabled(&mut self, on: bool) {
        self.set_flag(VLAN_TAG, on);
        self.set_flag(VLAN_UNTAG, on);
    }

    pub fn vlan_id(&self) -> u16 {
        self.get_short(VLAN_ID)
    }

    pub fn set_vlan_id(&mut self, id: u16) {
        self.put(VLAN_ID, &(id & 0x0fff).to_be_bytes());
    }

    pub fn port_vlan_ids(&self) -> [u16; PORTS] {
        std::array::from_fn(|i| self.get_short(PORT_VLANS + i * 2))
    }

    /// Extra ids past the fourth port are ignored.
    pub fn set_port_vlan_ids(&mut self, ids: &[u16]) {
        for (i, id) in ids.iter().take(PORTS).enumerate() {
            self.put(PORT_VLANS + i * 2, &id.to_be_bytes());
        }
    }

    pub fn manage_vlan(&self) -> u16 {
        self.get_short(MANAGE_VLAN)
    }

    pub fn set_manage_vlan(&mut self, id: u16) {
        self.put(MANAGE_VLAN, &id.to_be_bytes());
    }

    pub fn prio_vlans(&self) -> (u16, u16) {
        (self.get_short(PRIO_VLANS), self.get_short(PRIO_VLANS + 2))
    }

    pub fn set_prio_vlans(&mut self, first: u16, second: u16) {
        self.put(PRIO_VLANS, &first.to_be_bytes());
        self.put(PRIO_VLANS + 2, &second.to_be_bytes());
    }

    pub fn prio_ips(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.ipv4_at(PRIO_IPS), self.ipv4_at(PRIO_IPS + 4))
    }

    pub fn set_prio_ips(&mut self, first: Ipv4Addr, second: Ipv4Addr) {
        self.put(PRIO_IPS, &first.octets());
        self.put(PRIO_IPS + 4, &second.octets());
    }

    pub fn qos_mode(&self) -> u8 {
        self.byte_at(QOS_MODE)
    }

    /* ---------- traffic ---------- */

    pub fn internet_allowed(&self) -> bool {
        self.byte_at(INET_BLOCK) == 0
    }

    pub fn set_internet_allowed(&mut self, allow: bool) {
        self.put(INET_BLOCK, &[u8::from(!allow)]);
    }

    /// `(up, down)`
    pub fn speed_limits(&self) -> (u16, u16) {
        (self.get_short(SPEED_LIMIT), self.get_short(SPEED_LIMIT + 2))
    }

    pub fn set_speed_limits(&mut self, up: u16, down: u16) {
        self.put(SPEED_LIMIT, &up.to_be_bytes());
        self.put(SPEED_LIMIT + 2, &down.to_be_bytes());
    }

    /// Committed rates, `(up, down)`.
    pub fn cir(&self) -> (u16, u16) {
        (self.get_short(CIR), self.get_short(CIR + 2))
    }

    pub fn set_cir(&mut self, up: u16, down: u16) {
        self.put(CIR, &up.to_be_bytes());
        self.put(CIR + 2, &down.to_be_bytes());
    }

    pub fn set_mac_limit(&mut self, enabled: bool, limit: u8) {
        let v = (u8::from(enabled) << 7) | (limit & 0x7f);
        self.put(MAC_LIMIT, &[v]);
    }

    /* ---------- device defaults ---------- */

    pub fn llid_binding(&self) -> u8 {
        self.byte_at(LLID_BINDING)
    }

    pub fn set_llid_binding(&mut self, v: u8) {
        self.put(LLID_BINDING, &[v]);
    }

    pub fn set_anti_noise_disable(&mut self, disable: bool) {
        self.put(ANTI_NOISE, &[0xfe | u8::from(disable)]);
    }

    pub fn default_band(&self) -> u8 {
        self.byte_at(DEFAULT_BAND)
    }

    pub fn set_default_band(&mut self, band: u8) {
        self.put(DEFAULT_BAND, &[band]);
    }

    pub fn mode(&self) -> u8 {
        self.byte_at(MODE)
    }

    pub fn set_mode(&mut self, mode: u8) {
        self.put(MODE, &[mode]);
    }

    pub fn clt_tx_power_offset(&self) -> u8 {
        self.byte_at(CLT_TX_POWER_OFFSET)
    }

    pub fn set_clt_tx_power_offset(&mut self, v: u8) {
        self.put(CLT_TX_POWER_OFFSET, &[v]);
    }

    /// Priority queue buffer sizes in OAM 0xdd, 0xde, 0xdf order.
    pub fn set_clt_prio_buf(&mut self, sizes: [u16; 3]) {
        for (i, v) in sizes.into_iter().enumerate() {
            self.put(CLT_PRIO_BUF - i * 2, &v.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_fields_mirror_defaults() {
        let mut img = FirmwareImage::blank(Kind::Clt);
        img.set_ip(Ipv4Addr::new(192, 168, 1, 2));
        img.set_netmask(Ipv4Addr::new(255, 255, 255, 0));
        img.set_gateway(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(img.ip(), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(img.default_ip(), img.ip());
        assert_eq!(img.bytes(0x708, 4).unwrap(), &[255, 255, 255, 0]);
        assert_eq!(img.bytes(0x0c, 4).unwrap(), img.bytes(0x70c, 4).unwrap());

        let mac: MacAddr = "00:1e:e3:01:02:03".parse().unwrap();
        img.set_mac(mac);
        assert_eq!(img.mac(), mac);
        assert_eq!(img.bytes(0x790, 6).unwrap(), &mac.octets());
    }

    #[test]
    fn flags_touch_one_bit() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        img.set_byte(0x766, 0).unwrap();
        let force_nic = flag_by_name("force-nic").unwrap();
        img.set_flag(force_nic, true);
        assert_eq!(img.byte(0x766).unwrap(), 0x04);
        assert!(img.flag(force_nic));
        img.set_flag(force_nic, false);
        assert_eq!(img.byte(0x766).unwrap(), 0);

        img.set_byte(VLAN_FLAGS, 0).unwrap();
        img.set_vlan_enabled(true);
        assert_eq!(img.byte(VLAN_FLAGS).unwrap(), 0x03);
        assert!(flag_by_name("nope").is_none());
    }

    #[test]
    fn description_is_padded_and_trimmed() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        img.set_user_description("lab rack 3");
        assert_eq!(img.user_description(), "lab rack 3");
        assert_eq!(img.byte(USER_DESC + 10).unwrap(), 0);
        assert_eq!(img.byte(USER_DESC + 0x3f).unwrap(), 0);
        img.set_user_description(&"x".repeat(100));
        assert_eq!(img.user_description().len(), 64);
        assert_eq!(img.byte(USER_DESC + 0x40).unwrap(), 0xff);
    }

    #[test]
    fn vlan_and_traffic_fields() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        img.set_vlan_id(0x1123);
        assert_eq!(img.vlan_id(), 0x123);
        img.set_port_vlan_ids(&[0x123, 0x124, 0x125, 0x126, 0x127]);
        assert_eq!(img.port_vlan_ids(), [0x123, 0x124, 0x125, 0x126]);
        assert_eq!(img.byte(MAC_LIMIT).unwrap(), 0xff);
        img.set_mac_limit(true, 16);
        assert_eq!(img.byte(MAC_LIMIT).unwrap(), 0x90);
        img.set_speed_limits(100, 200);
        assert_eq!(img.speed_limits(), (100, 200));
        img.set_internet_allowed(false);
        assert!(!img.internet_allowed());
        img.set_clt_prio_buf([0xff00, 0xcfc0, 0xbf00]);
        assert_eq!(img.short(0x76d).unwrap(), 0xff00);
        assert_eq!(img.short(0x769).unwrap(), 0xbf00);
        img.set_anti_noise_disable(false);
        assert_eq!(img.byte(ANTI_NOISE).unwrap(), 0xfe);
    }

    #[test]
    fn eoc_type_marker() {
        let mut img = FirmwareImage::blank(Kind::Cnu);
        assert_eq!(img.eoc_type(), Kind::Clt);
        img.set_eoc_type(Kind::Cnu);
        assert_eq!(img.byte(EOC_TYPE).unwrap(), 1);
        assert_eq!(img.eoc_type(), Kind::Cnu);
        assert!(img.is_dirty());
    }
}

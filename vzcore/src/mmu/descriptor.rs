//! The module containing the ARMv7 short-descriptor translation table
//! entry layouts and the [`PageRecord`] exchanged with the rest of the
//! core.

use bitfield::bitfield;

/// Granularity of pool allocations; one L2 table.
pub const TTBL_MIN_SIZE: usize = 0x400;
/// Largest single table; one L1 table.
pub const TTBL_MAX_SIZE: usize = 0x4000;
/// Size of a first-level table: 4096 word entries.
pub const L1_TABLE_SIZE: usize = 0x4000;
/// Size of a second-level table: 256 word entries.
pub const L2_TABLE_SIZE: usize = 0x400;

/// Bytes covered by a small page.
pub const SMALL_PAGE_SIZE: u32 = 0x1000;
/// Bytes covered by a large page (16 replicated L2 entries).
pub const LARGE_PAGE_SIZE: u32 = 0x1_0000;
/// Bytes covered by a section.
pub const SECTION_PAGE_SIZE: u32 = 0x10_0000;
/// Bytes covered by a supersection.
pub const SUPSECTION_PAGE_SIZE: u32 = 0x100_0000;

/// Shift from a virtual address to its L1 slot index.
pub const L1_INDEX_SHIFT: u32 = 20;
/// Shift from a virtual address to its L2 slot index.
pub const L2_INDEX_SHIFT: u32 = 12;

/// L1 descriptor type field: no mapping.
pub const L1_TYPE_FAULT: u32 = 0;
/// L1 descriptor type field: pointer to an L2 table.
pub const L1_TYPE_L2TBL: u32 = 1;
/// L1 descriptor type field: section or supersection.
pub const L1_TYPE_SECTION: u32 = 2;

/// L2 descriptor type field: no mapping.
pub const L2_TYPE_FAULT: u32 = 0;
/// L2 descriptor type field: large page.
pub const L2_TYPE_LARGE: u32 = 1;
/// L2 descriptor type field: executable small page.
pub const L2_TYPE_SMALL_X: u32 = 2;
/// L2 descriptor type field: execute-never small page.
pub const L2_TYPE_SMALL_XN: u32 = 3;

/// Number of replicated descriptors forming a large page.
pub const LARGE_PAGE_ENTRIES: usize = 16;

/// Access permissions, AP2:AP[1:0] packed into three bits.
pub const AP_S_NONE_U_NONE: u32 = 0b000;
/// Supervisor read/write, user no access.
pub const AP_SRW_U_NONE: u32 = 0b001;
/// Supervisor read/write, user read-only.
pub const AP_SRW_U_READ: u32 = 0b010;
/// Supervisor read/write, user read/write.
pub const AP_SRW_U_RW: u32 = 0b011;
/// Supervisor read-only, user no access.
pub const AP_SREAD_U_NONE: u32 = 0b101;
/// Supervisor read-only, user read-only.
pub const AP_SREAD_U_READ: u32 = 0b110;

/// Domain of hypervisor-reserved mappings.
pub const DOM_RESERVED: u32 = 0;
/// Domain of virtual-TLB mappings installed while the guest MMU is off.
pub const DOM_VCPU_NOMMU: u32 = 1;
/// Domain of guest supervisor-only mappings.
pub const DOM_VCPU_SUPER: u32 = 2;
/// Domain of guest user mappings.
pub const DOM_VCPU_USER: u32 = 3;

/// DACR field value denying all access to a domain.
pub const DACR_NO_ACCESS: u32 = 0;
/// DACR field value enforcing descriptor permissions.
pub const DACR_CLIENT: u32 = 1;
/// DACR field value bypassing descriptor permissions.
pub const DACR_MANAGER: u32 = 3;

/// Implementation-defined tag marking reserved (hypervisor-owned)
/// mappings. Reserved-page operations require it.
pub const IMP_RESERVED: u32 = 1;

bitfield! {
    /// A first-level descriptor. Section, supersection and L2-pointer
    /// views share the word; which fields are live depends on
    /// `tte_type`.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct L1Entry(u32);
    impl Debug;
    /// Descriptor type.
    pub tte_type, set_tte_type: 1, 0;
    /// Bufferable.
    pub b, set_b: 2, 2;
    /// Cacheable (section view).
    pub c, set_c: 3, 3;
    /// Non-secure (L2-pointer view).
    pub ns_table, set_ns_table: 3, 3;
    /// Execute-never (section view).
    pub xn, set_xn: 4, 4;
    /// Domain.
    pub dom, set_dom: 8, 5;
    /// Implementation-defined tag.
    pub imp, set_imp: 9, 9;
    /// AP[1:0].
    pub ap, set_ap: 11, 10;
    /// TEX[2:0].
    pub tex, set_tex: 14, 12;
    /// AP[2].
    pub ap2, set_ap2: 15, 15;
    /// Shareable.
    pub s, set_s: 16, 16;
    /// Not-global.
    pub ng, set_ng: 17, 17;
    /// Supersection flag (section view).
    pub supersection, set_supersection: 18, 18;
    /// Non-secure (section view).
    pub ns_section, set_ns_section: 19, 19;
    /// Section base address, bits 31:20.
    pub section_base, set_section_base: 31, 20;
    /// Supersection base address, bits 31:24.
    pub supsection_base, set_supsection_base: 31, 24;
    /// L2 table base address, bits 31:10.
    pub table_base, set_table_base: 31, 10;
}

bitfield! {
    /// A second-level descriptor. Large-page and small-page views share
    /// the word.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct L2Entry(u32);
    impl Debug;
    /// Descriptor type.
    pub tte_type, set_tte_type: 1, 0;
    /// Execute-never (small-page view, folded into the type field).
    pub sxn, set_sxn: 0, 0;
    /// Bufferable.
    pub b, set_b: 2, 2;
    /// Cacheable.
    pub c, set_c: 3, 3;
    /// AP[1:0].
    pub ap, set_ap: 5, 4;
    /// TEX[2:0] (small-page view).
    pub stex, set_stex: 8, 6;
    /// AP[2].
    pub ap2, set_ap2: 9, 9;
    /// Shareable.
    pub s, set_s: 10, 10;
    /// Not-global.
    pub ng, set_ng: 11, 11;
    /// TEX[2:0] (large-page view).
    pub ltex, set_ltex: 14, 12;
    /// Execute-never (large-page view).
    pub lxn, set_lxn: 15, 15;
    /// Large page base address, bits 31:16.
    pub large_base, set_large_base: 31, 16;
    /// Small page base address, bits 31:12.
    pub small_base, set_small_base: 31, 12;
}

/// One guest-page mapping, as walked out of (or to be installed into) a
/// stage-1 table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageRecord {
    /// Physical base of the mapping.
    pub pa: u32,
    /// Virtual base, aligned to `sz`.
    pub va: u32,
    /// Mapping size; one of the four page sizes.
    pub sz: u32,
    /// Implementation-defined tag; [`IMP_RESERVED`] for hypervisor pages.
    pub imp: u32,
    /// Domain number.
    pub dom: u32,
    /// Packed access permissions.
    pub ap: u32,
    /// Execute-never.
    pub xn: u32,
    /// Non-secure.
    pub ns: u32,
    /// Not-global.
    pub ng: u32,
    /// Shareable.
    pub s: u32,
    /// Type extension.
    pub tex: u32,
    /// Cacheable.
    pub c: u32,
    /// Bufferable.
    pub b: u32,
}

impl PageRecord {
    /// Encodes the record as a section or supersection L1 descriptor.
    pub fn encode_section(&self) -> L1Entry {
        let mut tte = L1Entry::default();
        if self.sz == SECTION_PAGE_SIZE {
            tte.set_section_base(self.pa >> 20);
            tte.set_dom(self.dom);
        } else {
            tte.set_supsection_base(self.pa >> 24);
            tte.set_supersection(1);
        }
        tte.set_ns_section(self.ns);
        tte.set_ng(self.ng);
        tte.set_s(self.s);
        tte.set_ap2(self.ap >> 2);
        tte.set_ap(self.ap & 0x3);
        tte.set_tex(self.tex);
        tte.set_imp(self.imp);
        tte.set_xn(self.xn);
        tte.set_c(self.c);
        tte.set_b(self.b);
        tte.set_tte_type(L1_TYPE_SECTION);
        tte
    }

    /// Encodes the record as a large-page L2 descriptor.
    pub fn encode_large(&self) -> L2Entry {
        let mut tte = L2Entry::default();
        tte.set_large_base(self.pa >> 16);
        tte.set_ng(self.ng);
        tte.set_s(self.s);
        tte.set_ap2(self.ap >> 2);
        tte.set_ap(self.ap & 0x3);
        tte.set_ltex(self.tex);
        tte.set_lxn(self.xn);
        tte.set_c(self.c);
        tte.set_b(self.b);
        tte.set_tte_type(L2_TYPE_LARGE);
        tte
    }

    /// Encodes the record as a small-page L2 descriptor.
    pub fn encode_small(&self) -> L2Entry {
        let mut tte = L2Entry::default();
        tte.set_small_base(self.pa >> 12);
        tte.set_ng(self.ng);
        tte.set_s(self.s);
        tte.set_ap2(self.ap >> 2);
        tte.set_ap(self.ap & 0x3);
        tte.set_stex(self.tex);
        tte.set_c(self.c);
        tte.set_b(self.b);
        if self.xn != 0 {
            tte.set_tte_type(L2_TYPE_SMALL_XN);
        } else {
            tte.set_tte_type(L2_TYPE_SMALL_X);
        }
        tte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_roundtrip_fields() {
        let pg = PageRecord {
            pa: 0x8010_0000,
            va: 0x8010_0000,
            sz: SECTION_PAGE_SIZE,
            imp: IMP_RESERVED,
            dom: DOM_RESERVED,
            ap: AP_SRW_U_RW,
            c: 1,
            ..Default::default()
        };
        let tte = pg.encode_section();
        assert_eq!(tte.tte_type(), L1_TYPE_SECTION);
        assert_eq!(tte.section_base() << 20, 0x8010_0000);
        assert_eq!(tte.dom(), DOM_RESERVED);
        assert_eq!(tte.imp(), 1);
        assert_eq!((tte.ap2() << 2) | tte.ap(), AP_SRW_U_RW);
        assert_eq!(tte.c(), 1);
        assert_eq!(tte.supersection(), 0);
    }

    #[test]
    fn test_small_page_xn_selects_type() {
        let mut pg = PageRecord {
            pa: 0x1000,
            sz: SMALL_PAGE_SIZE,
            ap: AP_SRW_U_NONE,
            ..Default::default()
        };
        assert_eq!(pg.encode_small().tte_type(), L2_TYPE_SMALL_X);
        pg.xn = 1;
        assert_eq!(pg.encode_small().tte_type(), L2_TYPE_SMALL_XN);
    }

    #[test]
    fn test_large_page_encoding() {
        let pg = PageRecord {
            pa: 0xabcd_0000,
            sz: LARGE_PAGE_SIZE,
            ap: AP_SRW_U_RW,
            tex: 0x5,
            xn: 1,
            ..Default::default()
        };
        let tte = pg.encode_large();
        assert_eq!(tte.tte_type(), L2_TYPE_LARGE);
        assert_eq!(tte.large_base() << 16, 0xabcd_0000);
        assert_eq!(tte.ltex(), 0x5);
        assert_eq!(tte.lxn(), 1);
    }
}

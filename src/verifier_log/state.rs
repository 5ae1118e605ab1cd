//! Verifier state snapshots: registers, stack slots and tracked values.
//!
//! A state is introduced by an optional `frameN:` prefix followed by
//! space-separated `key=value` tokens. Keys starting with `fp` are stack
//! entries, everything else is a register. Values carry the kernel's full
//! type-and-range annotation; the instrumentation engine only cares about
//! which keys appear, but the rest is kept so statements render back out.

use std::fmt;

/// Liveness of a register or stack slot at a program point, from the
/// `_r` / `_w` / `_rw` / `_D` key suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Liveness {
    #[default]
    None,
    Read,
    Written,
    ReadWritten,
    Done,
}

impl Liveness {
    /// Split a liveness suffix off a state key.
    fn strip(key: &str) -> (&str, Liveness) {
        if let Some(rest) = key.strip_suffix("_rw") {
            (rest, Liveness::ReadWritten)
        } else if let Some(rest) = key.strip_suffix("_r") {
            (rest, Liveness::Read)
        } else if let Some(rest) = key.strip_suffix("_w") {
            (rest, Liveness::Written)
        } else if let Some(rest) = key.strip_suffix("_D") {
            (rest, Liveness::Done)
        } else {
            (key, Liveness::None)
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Liveness::None => "",
            Liveness::Read => "_r",
            Liveness::Written => "_w",
            Liveness::ReadWritten => "_rw",
            Liveness::Done => "_D",
        }
    }
}

/// Base type of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseType {
    #[default]
    NotInit,
    Scalar,
    Ctx,
    MapPtr,
    MapKey,
    MapValue,
    Fp,
    Pkt,
    PktMeta,
    PktEnd,
    FlowKeys,
    Sock,
    SockCommon,
    TcpSock,
    TpBuffer,
    XdpSock,
    BtfId,
    Mem,
    Buf,
    Func,
}

/// Base-type lexicon, longest name first so prefix matching never exits
/// early on a shorter name. `inv` is the pre-5.19 spelling of `scalar`.
const BASE_TYPES: &[(&str, BaseType)] = &[
    ("sock_common", BaseType::SockCommon),
    ("flow_keys", BaseType::FlowKeys),
    ("map_value", BaseType::MapValue),
    ("tp_buffer", BaseType::TpBuffer),
    ("map_key", BaseType::MapKey),
    ("map_ptr", BaseType::MapPtr),
    ("pkt_end", BaseType::PktEnd),
    ("pkt_meta", BaseType::PktMeta),
    ("tcp_sock", BaseType::TcpSock),
    ("xdp_sock", BaseType::XdpSock),
    ("scalar", BaseType::Scalar),
    ("func", BaseType::Func),
    ("ptr_", BaseType::BtfId),
    ("sock", BaseType::Sock),
    ("buf", BaseType::Buf),
    ("ctx", BaseType::Ctx),
    ("inv", BaseType::Scalar),
    ("mem", BaseType::Mem),
    ("pkt", BaseType::Pkt),
    ("fp", BaseType::Fp),
];

impl BaseType {
    fn as_str(self) -> &'static str {
        match self {
            BaseType::NotInit => "?",
            BaseType::Scalar => "scalar",
            BaseType::Ctx => "ctx",
            BaseType::MapPtr => "map_ptr",
            BaseType::MapKey => "map_key",
            BaseType::MapValue => "map_value",
            BaseType::Fp => "fp",
            BaseType::Pkt => "pkt",
            BaseType::PktMeta => "pkt_meta",
            BaseType::PktEnd => "pkt_end",
            BaseType::FlowKeys => "flow_keys",
            BaseType::Sock => "sock",
            BaseType::SockCommon => "sock_common",
            BaseType::TcpSock => "tcp_sock",
            BaseType::TpBuffer => "tp_buffer",
            BaseType::XdpSock => "xdp_sock",
            BaseType::BtfId => "ptr_",
            BaseType::Mem => "mem",
            BaseType::Buf => "buf",
            BaseType::Func => "func",
        }
    }
}

/// Full register type: base plus memory modifiers and nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegType {
    pub base: BaseType,
    pub rdonly: bool,
    pub alloc: bool,
    pub user: bool,
    pub per_cpu: bool,
    pub maybe_null: bool,
}

impl RegType {
    /// Drain type prefixes off the front of a value token. Returns the type,
    /// the precision marker, and the unconsumed remainder.
    fn parse(mut s: &str) -> (RegType, bool, &str) {
        let mut typ = RegType::default();
        let mut precise = false;

        if let Some(rest) = s.strip_prefix("rdonly_") {
            typ.rdonly = true;
            s = rest;
        }
        if let Some(rest) = s.strip_prefix("alloc_") {
            typ.alloc = true;
            s = rest;
        }
        if let Some(rest) = s.strip_prefix("user_") {
            typ.user = true;
            s = rest;
        }
        if let Some(rest) = s.strip_prefix("per_cpu_") {
            typ.per_cpu = true;
            s = rest;
        }

        if let Some(rest) = s.strip_prefix('P') {
            precise = true;
            s = rest;
        }

        for (name, base) in BASE_TYPES {
            if let Some(rest) = s.strip_prefix(name) {
                typ.base = *base;
                s = rest;
                break;
            }
        }

        if let Some(rest) = s.strip_prefix("_or_null").or_else(|| s.strip_prefix("or_null")) {
            typ.maybe_null = true;
            s = rest.strip_prefix('_').unwrap_or(rest);
        }

        if let Some(rest) = s.strip_prefix('P') {
            precise = true;
            s = rest;
        }

        (typ, precise, s)
    }
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rdonly {
            write!(f, "rdonly_")?;
        }
        if self.alloc {
            write!(f, "alloc_")?;
        }
        if self.user {
            write!(f, "user_")?;
        }
        if self.per_cpu {
            write!(f, "per_cpu_")?;
        }

        if self.base == BaseType::BtfId {
            write!(f, "ptr_")?;
            if self.maybe_null {
                write!(f, "or_null_")?;
            }
        } else {
            write!(f, "{}", self.base.as_str())?;
            if self.maybe_null {
                write!(f, "_or_null")?;
            }
        }
        Ok(())
    }
}

/// Tracked (tristate) number: `mask` bits are unknown, `value` bits known.
/// `mask == 0` is a constant, `mask == !0` fully unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TNum {
    pub value: u64,
    pub mask: u64,
}

impl TNum {
    pub const fn constant(value: u64) -> TNum {
        TNum { value, mask: 0 }
    }

    pub const fn unknown() -> TNum {
        TNum { value: 0, mask: u64::MAX }
    }

    pub const fn is_const(self) -> bool {
        self.mask == 0
    }

    pub const fn is_unknown(self) -> bool {
        self.mask == u64::MAX
    }
}

impl Default for TNum {
    fn default() -> Self {
        TNum::unknown()
    }
}

/// The value part of a register state, everything after the `=`.
///
/// Example: `invP(id=2,umax_value=255,var_off=(0x0; 0xff))`
#[derive(Debug, Clone, PartialEq)]
pub struct RegValue {
    pub typ: RegType,
    /// When false and the type is scalar, min/max/tnum don't affect safety.
    pub precise: bool,
    pub id: i64,
    pub ref_obj_id: i64,
    pub off: i32,
    pub range: i64,
    pub key_size: u32,
    pub value_size: u32,
    pub var_off: TNum,
    pub smin: i64,
    pub smax: i64,
    pub umin: u64,
    pub umax: u64,
    pub s32_min: i32,
    pub s32_max: i32,
    pub u32_min: u32,
    pub u32_max: u32,
    pub btf_name: String,
}

impl Default for RegValue {
    fn default() -> Self {
        RegValue {
            typ: RegType::default(),
            precise: false,
            id: 0,
            ref_obj_id: 0,
            off: 0,
            range: 0,
            key_size: 0,
            value_size: 0,
            var_off: TNum::unknown(),
            smin: i64::MIN,
            smax: i64::MAX,
            umin: 0,
            umax: u64::MAX,
            s32_min: i32::MIN,
            s32_max: i32::MAX,
            u32_min: 0,
            u32_max: u32::MAX,
            btf_name: String::new(),
        }
    }
}

impl RegValue {
    pub fn parse(token: &str) -> RegValue {
        let token = token.trim();
        let (typ, precise, mut rest) = RegType::parse(token);
        let mut val = RegValue {
            typ,
            precise,
            ..RegValue::default()
        };

        // Known constants print as a bare integer: `2`, `P2`, `invP2`, `fp-8`.
        if matches!(val.typ.base, BaseType::Scalar | BaseType::Fp | BaseType::NotInit) {
            if let Ok(n) = rest.parse::<i64>() {
                if val.typ.base == BaseType::NotInit {
                    val.typ.base = BaseType::Scalar;
                }
                val.var_off = TNum::constant(n as u64);
                return val;
            }
        }

        if val.typ.base == BaseType::BtfId {
            let name_end = rest.find('(').unwrap_or(rest.len());
            val.btf_name = rest[..name_end].to_string();
            rest = &rest[name_end..];
        }

        let rest = rest
            .strip_prefix('(')
            .unwrap_or(rest)
            .strip_suffix(')')
            .unwrap_or(rest);

        for pair in split_fields(rest) {
            let Some(eq) = pair.find('=') else { continue };
            let key = &pair[..eq];
            let text = &pair[eq + 1..];
            let int = text.parse::<i64>().unwrap_or(0);
            let uint = text.parse::<u64>().unwrap_or(0);

            match key {
                "id" => val.id = int,
                "ref_obj_id" => val.ref_obj_id = int,
                "off" => val.off = int as i32,
                "r" => val.range = int,
                "ks" => val.key_size = int as u32,
                "vs" => val.value_size = int as u32,
                "imm" => val.var_off = TNum::constant(int as u64),
                "smin" | "smin_value" => val.smin = int,
                "smax" | "smax_value" => val.smax = int,
                "umin" | "umin_value" => val.umin = uint,
                "umax" | "umax_value" => val.umax = uint,
                "s32_min" | "s32_min_value" => val.s32_min = int as i32,
                "s32_max" | "s32_max_value" => val.s32_max = int as i32,
                "u32_min" | "u32_min_value" => val.u32_min = uint as u32,
                "u32_max" | "u32_max_value" => val.u32_max = uint as u32,
                "var_off" => {
                    if let Some(tnum) = parse_tnum(text) {
                        val.var_off = tnum;
                    }
                }
                _ => {}
            }
        }

        val
    }
}

/// Split a `k=v,k=v` list on commas, keeping `var_off=(0x0; 0xff)` together.
fn split_fields(s: &str) -> impl Iterator<Item = &str> {
    let mut depth = 0i32;
    let mut start = 0;
    let mut out = Vec::new();
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out.into_iter()
}

/// Parse `(0x0; 0xff)` into a tnum.
fn parse_tnum(text: &str) -> Option<TNum> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (value, mask) = inner.split_once(';')?;
    let value = u64::from_str_radix(value.trim().trim_start_matches("0x"), 16).ok()?;
    let mask = u64::from_str_radix(mask.trim().trim_start_matches("0x"), 16).ok()?;
    Some(TNum { value, mask })
}

impl fmt::Display for RegValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.typ.base;

        if base == BaseType::Scalar && self.precise {
            write!(f, "P")?;
        }

        if self.var_off.is_const() && matches!(base, BaseType::Scalar | BaseType::Fp) {
            return match base {
                BaseType::Scalar => {
                    write!(f, "{}", self.var_off.value as i64 + self.off as i64)
                }
                _ => write!(f, "fp{}", self.var_off.value as i64 + self.off as i64),
            };
        }

        write!(f, "{}", self.typ)?;
        if base == BaseType::BtfId {
            write!(f, "{}", self.btf_name)?;
        }

        let mut args = Vec::new();
        if self.id != 0 {
            args.push(format!("id={}", self.id));
        }
        if matches!(base, BaseType::Sock | BaseType::TcpSock | BaseType::Mem) {
            args.push(format!("ref_obj_id={}", self.ref_obj_id));
        }
        if base != BaseType::Scalar {
            args.push(format!("off={}", self.off));
        }
        if matches!(base, BaseType::Pkt | BaseType::PktMeta) {
            args.push(format!("r={}", self.range));
        } else if matches!(base, BaseType::MapPtr | BaseType::MapKey | BaseType::MapValue) {
            args.push(format!("ks={},vs={}", self.key_size, self.value_size));
        }

        if self.var_off.is_const() {
            args.push(format!("imm={}", self.var_off.value as i64));
        } else {
            if self.smin != self.umin as i64 && self.smin != i64::MIN {
                args.push(format!("smin={}", self.smin));
            }
            if self.smax != self.umax as i64 && self.smax != i64::MAX {
                args.push(format!("smax={}", self.smax));
            }
            if self.umin != 0 {
                args.push(format!("umin={}", self.umin));
            }
            if self.umax != u64::MAX {
                args.push(format!("umax={}", self.umax));
            }
            if !self.var_off.is_unknown() {
                args.push(format!(
                    "var_off=({:#x}; {:#x})",
                    self.var_off.value, self.var_off.mask
                ));
            }
            if self.s32_min as i64 != self.smin && self.s32_min != i32::MIN {
                args.push(format!("s32_min={}", self.s32_min));
            }
            if self.s32_max as i64 != self.smax && self.s32_max != i32::MAX {
                args.push(format!("s32_max={}", self.s32_max));
            }
            if self.u32_min as u64 != self.umin && self.u32_min != 0 {
                args.push(format!("u32_min={}", self.u32_min));
            }
            if self.u32_max as u64 != self.umax && self.u32_max != u32::MAX {
                args.push(format!("u32_max={}", self.u32_max));
            }
        }

        write!(f, "({})", args.join(","))
    }
}

/// A single register and its state.
///
/// Example: `R1_w=invP(id=2,umax_value=255,var_off=(0x0; 0xff))`
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterState {
    pub reg: u8,
    pub liveness: Liveness,
    pub value: RegValue,
}

impl RegisterState {
    fn parse(key: &str, value: &str) -> RegisterState {
        let (key, liveness) = Liveness::strip(key);
        let reg = key.trim_start_matches('R').parse::<u8>().unwrap_or(0);
        RegisterState {
            reg,
            liveness,
            value: RegValue::parse(value),
        }
    }
}

impl fmt::Display for RegisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}{}={}", self.reg, self.liveness.suffix(), self.value)
    }
}

/// Annotation of one byte within a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Invalid,
    Spill,
    Misc,
    Zero,
}

impl SlotKind {
    fn from_char(c: char) -> SlotKind {
        match c {
            'r' => SlotKind::Spill,
            'm' => SlotKind::Misc,
            '0' => SlotKind::Zero,
            _ => SlotKind::Invalid,
        }
    }

    fn as_char(self) -> char {
        match self {
            SlotKind::Invalid => '?',
            SlotKind::Spill => 'r',
            SlotKind::Misc => 'm',
            SlotKind::Zero => '0',
        }
    }
}

/// State of one 8-byte stack slot.
///
/// Example: `fp-8=m???????` or `fp-16=map_value`
#[derive(Debug, Clone, PartialEq)]
pub struct StackState {
    /// Slot offset below the frame pointer, stored positive (`fp-8` is 8).
    pub offset: i32,
    pub liveness: Liveness,
    /// Spilled register value, base `NotInit` when the slot holds raw bytes.
    pub spilled: RegValue,
    pub slots: Vec<SlotKind>,
}

impl StackState {
    fn parse(key: &str, value: &str) -> StackState {
        let (key, liveness) = Liveness::strip(key);
        let offset = key
            .trim_start_matches("fp")
            .trim_start_matches('-')
            .parse::<i32>()
            .unwrap_or(0);

        let mut state = StackState {
            offset,
            liveness,
            spilled: RegValue::default(),
            slots: Vec::new(),
        };

        // Eight bytes of `?rm0` annotations take priority: `00000000` is a
        // valid slot string, not a spilled scalar constant.
        if value.len() == 8 && value.chars().all(|c| matches!(c, '?' | 'r' | 'm' | '0')) {
            state.slots = value.chars().map(SlotKind::from_char).collect();
            return state;
        }

        let parsed = RegValue::parse(value);
        if parsed.typ.base != BaseType::NotInit {
            state.spilled = parsed;
        } else {
            state.slots = value.chars().map(SlotKind::from_char).collect();
        }
        state
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fp-{}{}=", self.offset, self.liveness.suffix())?;
        if self.spilled.typ.base != BaseType::NotInit {
            write!(f, "{}", self.spilled)
        } else {
            for slot in &self.slots {
                write!(f, "{}", slot.as_char())?;
            }
            Ok(())
        }
    }
}

/// Description of the verifier's state at one point.
///
/// Example: `frame1: R2_w=invP(id=0) R10=fp0 fp-16_w=mmmmmmmm`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VerifierState {
    pub frame: usize,
    pub registers: Vec<RegisterState>,
    pub stack: Vec<StackState>,
}

impl VerifierState {
    pub fn parse(line: &str) -> VerifierState {
        let mut state = VerifierState::default();
        let mut line = line.trim();

        if let Some(rest) = line.strip_prefix("frame") {
            if let Some((frame, tail)) = rest.split_once(':') {
                if let Ok(frame) = frame.parse::<usize>() {
                    state.frame = frame;
                    line = tail.trim_start();
                }
            }
        }

        while let Some(eq) = line.find('=') {
            let key = line[..eq].trim();
            let (value, rest) = take_token(&line[eq + 1..]);
            line = rest;

            // Other annotations (`refs=...` and friends) are not part of the
            // register or stack state.
            if key.starts_with("fp") {
                state.stack.push(StackState::parse(key, value));
            } else if key.starts_with('R') {
                state.registers.push(RegisterState::parse(key, value));
            }
        }

        state
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.stack.is_empty()
    }

    /// Merge another state's entries by key: existing entries for the same
    /// register or slot offset are replaced, new entries appended. Keys are
    /// never removed, so merging is monotone.
    pub fn merge_from(&mut self, other: &VerifierState) {
        for reg in &other.registers {
            match self.registers.iter_mut().find(|r| r.reg == reg.reg) {
                Some(existing) => *existing = reg.clone(),
                None => self.registers.push(reg.clone()),
            }
        }
        for slot in &other.stack {
            match self.stack.iter_mut().find(|s| s.offset == slot.offset) {
                Some(existing) => *existing = slot.clone(),
                None => self.stack.push(slot.clone()),
            }
        }
    }
}

/// Take one `value` token, tracking bracket depth so spaces inside
/// parentheses do not terminate it. Returns the token and the rest.
fn take_token(s: &str) -> (&str, &str) {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ' ' if depth == 0 => return (&s[..i], &s[i + 1..]),
            _ => {}
        }
    }
    (s, "")
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frame != 0 {
            write!(f, "frame{}: ", self.frame)?;
        }

        let mut first = true;
        for reg in &self.registers {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{reg}")?;
            first = false;
        }
        for slot in &self.stack {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{slot}")?;
            first = false;
        }
        Ok(())
    }
}

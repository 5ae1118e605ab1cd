//! BPF program types and the section-name lexicon mapping onto them.

use std::fmt;

/// Kernel program type, values from `enum bpf_prog_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ProgType {
    #[default]
    Unspecified = 0,
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    CgroupDevice = 15,
    SkMsg = 16,
    RawTracepoint = 17,
    CgroupSockAddr = 18,
    LwtSeg6local = 19,
    LircMode2 = 20,
    SkReuseport = 21,
    FlowDissector = 22,
    CgroupSysctl = 23,
    RawTracepointWritable = 24,
    CgroupSockopt = 25,
    Tracing = 26,
    StructOps = 27,
    Extension = 28,
    Lsm = 29,
    SkLookup = 30,
    Syscall = 31,
}

/// Fixed section-prefix lexicon. Also the accepted values for an explicit
/// `--prog-type` override.
pub const SECTION_TYPES: &[(&str, ProgType)] = &[
    ("socket", ProgType::SocketFilter),
    ("sk_reuseport/migrate", ProgType::SkReuseport),
    ("sk_reuseport", ProgType::SkReuseport),
    ("kprobe", ProgType::Kprobe),
    ("uprobe", ProgType::Kprobe),
    ("kretprobe", ProgType::Kprobe),
    ("uretprobe", ProgType::Kprobe),
    ("tc", ProgType::SchedCls),
    ("classifier", ProgType::SchedCls),
    ("action", ProgType::SchedAct),
    ("tracepoint", ProgType::Tracepoint),
    ("tp", ProgType::Tracepoint),
    ("raw_tracepoint.w", ProgType::RawTracepointWritable),
    ("raw_tracepoint", ProgType::RawTracepoint),
    ("raw_tp.w", ProgType::RawTracepointWritable),
    ("raw_tp", ProgType::RawTracepoint),
    ("tp_btf", ProgType::Tracing),
    ("fentry.s", ProgType::Tracing),
    ("fentry", ProgType::Tracing),
    ("fmod_ret.s", ProgType::Tracing),
    ("fmod_ret", ProgType::Tracing),
    ("fexit.s", ProgType::Tracing),
    ("fexit", ProgType::Tracing),
    ("freplace", ProgType::Extension),
    ("lsm.s", ProgType::Lsm),
    ("lsm", ProgType::Lsm),
    ("iter", ProgType::Tracing),
    ("syscall", ProgType::Syscall),
    ("xdp_devmap", ProgType::Xdp),
    ("xdp_cpumap", ProgType::Xdp),
    ("xdp", ProgType::Xdp),
    ("perf_event", ProgType::PerfEvent),
    ("lwt_in", ProgType::LwtIn),
    ("lwt_out", ProgType::LwtOut),
    ("lwt_xmit", ProgType::LwtXmit),
    ("lwt_seg6local", ProgType::LwtSeg6local),
    ("cgroup_skb/ingress", ProgType::CgroupSkb),
    ("cgroup_skb/egress", ProgType::CgroupSkb),
    ("cgroup/skb", ProgType::CgroupSkb),
    ("cgroup/sock_create", ProgType::CgroupSock),
    ("cgroup/sock_release", ProgType::CgroupSock),
    ("cgroup/sock", ProgType::CgroupSock),
    ("cgroup/post_bind4", ProgType::CgroupSock),
    ("cgroup/post_bind6", ProgType::CgroupSock),
    ("cgroup/dev", ProgType::CgroupDevice),
    ("sockops", ProgType::SockOps),
    ("sk_skb/stream_parser", ProgType::SkSkb),
    ("sk_skb/stream_verdict", ProgType::SkSkb),
    ("sk_skb", ProgType::SkSkb),
    ("sk_msg", ProgType::SkMsg),
    ("lirc_mode2", ProgType::LircMode2),
    ("flow_dissector", ProgType::FlowDissector),
    ("cgroup/bind4", ProgType::CgroupSockAddr),
    ("cgroup/bind6", ProgType::CgroupSockAddr),
    ("cgroup/connect4", ProgType::CgroupSockAddr),
    ("cgroup/connect6", ProgType::CgroupSockAddr),
    ("cgroup/sendmsg4", ProgType::CgroupSockAddr),
    ("cgroup/sendmsg6", ProgType::CgroupSockAddr),
    ("cgroup/recvmsg4", ProgType::CgroupSockAddr),
    ("cgroup/recvmsg6", ProgType::CgroupSockAddr),
    ("cgroup/getpeername4", ProgType::CgroupSockAddr),
    ("cgroup/getpeername6", ProgType::CgroupSockAddr),
    ("cgroup/getsockname4", ProgType::CgroupSockAddr),
    ("cgroup/getsockname6", ProgType::CgroupSockAddr),
    ("cgroup/sysctl", ProgType::CgroupSysctl),
    ("cgroup/getsockopt", ProgType::CgroupSockopt),
    ("cgroup/setsockopt", ProgType::CgroupSockopt),
    ("struct_ops", ProgType::StructOps),
    ("sk_lookup", ProgType::SkLookup),
    ("seccomp", ProgType::SocketFilter),
];

impl ProgType {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Resolve an explicit type name, as given to `--prog-type`.
    pub fn from_flag(flag: &str) -> Option<ProgType> {
        SECTION_TYPES
            .iter()
            .find(|(name, _)| *name == flag)
            .map(|(_, ty)| *ty)
    }

    /// Infer the program type from an ELF section name. The longest lexicon
    /// entry that matches the whole name or a `prefix/` of it wins.
    pub fn for_section(section: &str) -> ProgType {
        let mut best: Option<(&str, ProgType)> = None;
        for (prefix, ty) in SECTION_TYPES {
            let matches = section == *prefix
                || section
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'));
            if matches && best.is_none_or(|(b, _)| prefix.len() > b.len()) {
                best = Some((prefix, *ty));
            }
        }
        best.map(|(_, ty)| ty).unwrap_or(ProgType::Unspecified)
    }

    /// All accepted `--prog-type` values, for error messages.
    pub fn flag_names() -> Vec<&'static str> {
        let mut names: Vec<_> = SECTION_TYPES.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl fmt::Display for ProgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

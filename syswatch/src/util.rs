use log::debug;

pub fn memlock() {
    // Increase memlock limit (required for eBPF)
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("Failed to remove limit on locked memory: ret = {}", ret);
    }
}

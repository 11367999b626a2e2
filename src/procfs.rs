//! Readers for the /proc and /sys touchpoints of the engine: thread
//! enumeration, thread names and states, the target's cpuset, tracepoint ids
//! and the dynamic uprobe PMU type.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

pub fn read_string_lossy<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let data = fs::read(path)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Reads `/proc/<pid>/maps` as one string, for the unwinder's maps snapshot.
pub fn read_maps(pid: i32) -> io::Result<String> {
    read_string_lossy(format!("/proc/{pid}/maps"))
}

/// The tids of all threads of `pid`, in the order the kernel lists them.
pub fn threads_of_process(pid: i32) -> io::Result<Vec<i32>> {
    let mut tids = Vec::new();
    for entry in (fs::read_dir(format!("/proc/{pid}/task"))?).flatten() {
        if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// All (pid, tid) pairs on the system. Seeds the tid→pid association.
pub fn all_pids_and_tids() -> Vec<(i32, i32)> {
    let mut pairs = Vec::new();
    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return pairs;
    };
    for entry in proc_dir.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        // The process can exit while we walk /proc; just skip it then.
        if let Ok(tids) = threads_of_process(pid) {
            for tid in tids {
                pairs.push((pid, tid));
            }
        }
    }
    pairs
}

/// The comm of a thread, with the trailing newline and any NUL tail removed.
pub fn thread_name(tid: i32) -> Option<String> {
    let mut buffer = Vec::new();
    let mut file = File::open(format!("/proc/{tid}/comm")).ok()?;
    file.read_to_end(&mut buffer).ok()?;
    let length = memchr::memchr(b'\0', &buffer).unwrap_or(buffer.len());
    buffer.truncate(length);
    if buffer.last() == Some(&b'\n') {
        buffer.pop();
    }
    Some(String::from_utf8_lossy(&buffer).into_owned())
}

/// The state letter from field 3 of `/proc/<tid>/stat` (R, S, D, T, t, X, Z,
/// P, I). The comm in field 2 is parenthesized and can itself contain spaces
/// and parentheses, so scan from the last ')'.
pub fn thread_state_char(tid: i32) -> Option<char> {
    let stat = read_string_lossy(format!("/proc/{tid}/stat")).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// Number of logical cores, as perf_event_open counts "CPUs".
pub fn num_cores() -> i32 {
    num_cpus::get() as i32
}

/// The cpuset portion of `/proc/<pid>/cgroup`, e.g. "/app" for a line like
/// "7:cpuset:/app". On cgroup v2 unified hierarchies there is no per-controller
/// line, in which case the unified path (line "0::/...") is returned.
fn extract_cpuset_path(cgroup_content: &str) -> Option<String> {
    let mut unified = None;
    for line in cgroup_content.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        if controllers.split(',').any(|c| c == "cpuset") {
            return Some(path.to_string());
        }
        if controllers.is_empty() {
            unified = Some(path.to_string());
        }
    }
    unified
}

/// Parses a cpuset list like "0-2,4,7-8" into the individual cpu numbers.
fn parse_cpuset_cpus(cpuset_cpus_content: &str) -> Vec<i32> {
    let mut cpus = Vec::new();
    for range in cpuset_cpus_content.trim().split(',') {
        if range.is_empty() {
            continue;
        }
        match range.split_once('-') {
            Some((first, last)) => {
                let (Ok(first), Ok(last)) = (first.parse::<i32>(), last.parse::<i32>()) else {
                    continue;
                };
                cpus.extend(first..=last);
            }
            None => {
                if let Ok(cpu) = range.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// The cores the target process can be scheduled on, from its cgroup's
/// cpuset. Empty when the cpuset cannot be determined; the caller then falls
/// back to all cores.
pub fn cpuset_cpus(pid: i32) -> Vec<i32> {
    let Ok(cgroup) = read_string_lossy(format!("/proc/{pid}/cgroup")) else {
        return Vec::new();
    };
    let Some(cpuset_path) = extract_cpuset_path(&cgroup) else {
        return Vec::new();
    };
    let cpuset_path = cpuset_path.trim_matches('/');
    let candidates = [
        format!("/sys/fs/cgroup/cpuset/{cpuset_path}/cpuset.cpus"),
        format!("/sys/fs/cgroup/{cpuset_path}/cpuset.cpus.effective"),
    ];
    for candidate in &candidates {
        if let Ok(content) = read_string_lossy(candidate) {
            let cpus = parse_cpuset_cpus(&content);
            if !cpus.is_empty() {
                return cpus;
            }
        }
    }
    Vec::new()
}

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Looks up the id of the tracepoint `<category>:<name>` in tracefs.
pub fn tracepoint_id(category: &str, name: &str) -> io::Result<u64> {
    let mut last_error = io::Error::from(io::ErrorKind::NotFound);
    for root in TRACEFS_ROOTS {
        match read_string_lossy(format!("{root}/events/{category}/{name}/id")) {
            Ok(content) => {
                return content.trim().parse().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("malformed tracepoint id for {category}:{name}"),
                    )
                })
            }
            Err(error) => last_error = error,
        }
    }
    Err(last_error)
}

/// Whether the amdgpu tracepoint category exists, i.e. the amdgpu driver is
/// loaded. Decides the default for GPU driver tracing.
pub fn amdgpu_tracepoints_exist() -> bool {
    TRACEFS_ROOTS
        .iter()
        .any(|root| Path::new(&format!("{root}/events/amdgpu")).exists())
}

/// The dynamic PMU type of the uprobe event source.
pub fn uprobe_pmu_type() -> io::Result<u32> {
    let content = read_string_lossy("/sys/bus/event_source/devices/uprobe/type")?;
    content.trim().parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "malformed uprobe PMU type")
    })
}

/// Raises the soft RLIMIT_NOFILE to the hard limit. With two fds per
/// instrumented function per core, the default soft limit is quickly
/// exhausted.
pub fn raise_open_files_soft_limit() -> io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_cpuset_path_from_v1_cgroup() {
        let content = "12:pids:/user.slice\n7:cpuset:/game\n1:name=systemd:/init.scope\n";
        assert_eq!(extract_cpuset_path(content), Some("/game".to_string()));
    }

    #[test]
    fn extracts_unified_path_when_no_cpuset_controller() {
        let content = "0::/user.slice/session.scope\n";
        assert_eq!(
            extract_cpuset_path(content),
            Some("/user.slice/session.scope".to_string())
        );
    }

    #[test]
    fn parses_cpuset_cpu_lists() {
        assert_eq!(parse_cpuset_cpus("0-2,4,7-8\n"), vec![0, 1, 2, 4, 7, 8]);
        assert_eq!(parse_cpuset_cpus("3"), vec![3]);
        assert_eq!(parse_cpuset_cpus(""), Vec::<i32>::new());
    }

    #[test]
    fn current_thread_state_is_running() {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        assert_eq!(thread_state_char(tid), Some('R'));
    }

    #[test]
    fn current_process_is_listed() {
        let pid = std::process::id() as i32;
        let tids = threads_of_process(pid).unwrap();
        assert!(!tids.is_empty());
        assert!(thread_name(pid).is_some());
    }
}

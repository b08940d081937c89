//! Init script synthesis.
//!
//! Every bundle carries a generated `/sbin/init` that reproduces the
//! image's environment, working directory, and entry command under a
//! shell running as pid 1. The script leans entirely on the bundled
//! busybox so images without a userland of their own still boot.

use crate::oci::image::RunConfig;

/// Escape a value for interpolation inside a double-quoted shell string.
///
/// Backslash, double quote, and dollar are the only characters with
/// meaning in that context; everything else, including newlines and
/// control bytes, passes through untouched.
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render the init script for an image's run configuration.
pub fn render(config: &RunConfig) -> String {
    let mut s = String::new();
    s.push_str("#!/busybox-lxd sh\n\n");

    // exports are guarded so variables set by the container manager at
    // start time win over the image defaults
    for keyval in &config.env {
        let key = keyval.split('=').next().unwrap_or(keyval);
        s.push_str(&format!(
            "if [ -z \"${{{key}+x}}\" ]; then export \"{}\"; fi\n",
            shell_escape(keyval)
        ));
    }

    s.push_str(&format!("cd \"{}\"\n", shell_escape(&config.working_dir)));

    // some containers need shared memory
    s.push_str("/busybox-lxd mkdir -p /dev/shm\n");
    s.push_str("/busybox-lxd mount -t tmpfs shmfs /dev/shm\n");

    // containers rarely need to be routers
    s.push_str("/busybox-lxd echo 0 > /proc/sys/net/ipv4/ip_forward\n");
    s.push_str("/busybox-lxd echo 0 > /proc/sys/net/ipv6/conf/all/forwarding\n");

    // -R releases the lease on exit, -b backgrounds after obtaining one
    s.push_str("/busybox-lxd udhcpc -R -b -i eth0 -s /lxd-udhcpc-default.script\n");

    for arg in config.entrypoint.iter().chain(config.cmd.iter()) {
        s.push_str(&format!("\"{}\" ", shell_escape(arg)));
    }
    s.push_str("&\n");

    // the container manager stops us with SIGPWR; forward it as SIGTERM
    // so the child shuts down cleanly
    s.push_str("trap 'kill -15 $child' PWR\n");
    s.push_str("child=$!; wait \"$child\"\n");
    s
}

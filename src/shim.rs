//! # Container Shim
//!
//! The shim is a POSIX shell script that runs inside the executor, one
//! level below the engine, as the last stage before user code starts.
//! It receives a freshly-extracted rootfs plus a command and turns them
//! into a chrooted, mounted, user-dropped running process.
//!
//! Fixed argv: `rootfs mounts workdir user pid_file [cmd…]`, where
//! `mounts` is a comma-separated `src:dst` list or the literal `none`,
//! and `workdir`/`user` use `none` as their empty sentinel.
//!
//! The engine rewrites the shim to [`SHIM_PATH`] on every `run`, so a
//! binary upgrade propagates to the whole fleet without a migration
//! step.
//!
//! [`SHIM_PATH`]: crate::constants::SHIM_PATH

use crate::constants::SHIM_PATH;
use crate::executor::shell_join;

/// The bootstrap script installed to `/usr/local/bin/container-shim`.
pub const SHIM_SCRIPT: &str = r#"#!/bin/sh
ROOTFS=$1
MOUNTS=$2
WORKDIR=$3
USER=$4
PID_FILE=$5
shift 5

if [ -z "$ROOTFS" ]; then
  echo "Error: ROOTFS is empty. Refusing to continue to protect the host." >&2
  exit 1
fi

if [ ! -d "$ROOTFS" ]; then
  echo "Error: rootfs $ROOTFS not found" >&2
  exit 1
fi

if [ -n "$PID_FILE" ] && [ "$PID_FILE" != "none" ]; then
  echo $$ > "$PID_FILE"
fi

# 1. System mounts
mkdir -p "$ROOTFS/proc" "$ROOTFS/sys" "$ROOTFS/dev" "$ROOTFS/tmp" "$ROOTFS/etc"
mount -t proc proc "$ROOTFS/proc"
mount -t sysfs sysfs "$ROOTFS/sys"
mount --rbind /dev "$ROOTFS/dev"
mkdir -p "$ROOTFS/dev/pts" "$ROOTFS/dev/shm"
mount -t devpts devpts "$ROOTFS/dev/pts" -o newinstance,ptmxmode=0666
mount -t tmpfs tmpfs "$ROOTFS/dev/shm"
mount -t tmpfs tmpfs "$ROOTFS/tmp"
ip link set lo up 2>/dev/null || true

# 2. DNS
if [ -f /etc/resolv.conf ]; then
  cat /etc/resolv.conf > "$ROOTFS/etc/resolv.conf" 2>/dev/null
fi
if [ ! -s "$ROOTFS/etc/resolv.conf" ]; then
  echo "nameserver 8.8.8.8" > "$ROOTFS/etc/resolv.conf"
fi

# 3. Hosts + service discovery
rm -f "$ROOTFS/etc/hosts"
echo "127.0.0.1 localhost" > "$ROOTFS/etc/hosts"
echo "::1       localhost ip6-localhost ip6-loopback" >> "$ROOTFS/etc/hosts"
echo "127.0.1.1 plx-container" >> "$ROOTFS/etc/hosts"
if [ -f "$ROOTFS/etc/hosts-extra" ]; then
  cat "$ROOTFS/etc/hosts-extra" >> "$ROOTFS/etc/hosts"
fi

# 4. Bind mounts (src1:dst1,src2:dst2)
if [ "$MOUNTS" != "none" ]; then
  echo "$MOUNTS" | tr ',' '\n' | while read -r m; do
    SRC=$(echo "$m" | cut -d: -f1)
    DST=$(echo "$m" | cut -d: -f2)
    if [ -n "$SRC" ] && [ -n "$DST" ]; then
      mkdir -p "$ROOTFS/$DST"
      mount --bind "$SRC" "$ROOTFS/$DST"
    fi
  done
fi

# 5. Working directory
CD_CMD=""
if [ "$WORKDIR" != "none" ] && [ -n "$WORKDIR" ]; then
  mkdir -p "$ROOTFS/$WORKDIR"
  CD_CMD="cd \"$WORKDIR\" && "
fi

# 6. PATH (engine may override via PLX_CONTAINER_PATH)
if [ -n "$PLX_CONTAINER_PATH" ]; then
  export PATH="$PLX_CONTAINER_PATH"
else
  export PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin
fi

# 7. User sanity check: fall back to root if the user is unknown
if [ -n "$USER" ] && [ "$USER" != "root" ] && [ "$USER" != "none" ]; then
  if ! /usr/sbin/chroot "$ROOTFS" id "$USER" >/dev/null 2>&1; then
    if ! grep -q "^$USER:" "$ROOTFS/etc/passwd" 2>/dev/null; then
      echo "Warning: user '$USER' not found in /etc/passwd, falling back to root" >&2
      USER="root"
    fi
  fi
fi

# 8. Exec into the container
if [ $# -eq 0 ]; then
  if [ -n "$USER" ] && [ "$USER" != "root" ] && [ "$USER" != "none" ]; then
    SU_EXE="su"
    if [ -f "$ROOTFS/bin/su" ]; then SU_EXE="/bin/su"; elif [ -f "$ROOTFS/usr/bin/su" ]; then SU_EXE="/usr/bin/su"; fi
    exec /usr/sbin/chroot "$ROOTFS" "$SU_EXE" - "$USER"
  else
    exec /usr/sbin/chroot "$ROOTFS" /bin/sh
  fi
else
  if [ -n "$USER" ] && [ "$USER" != "root" ] && [ "$USER" != "none" ]; then
    SU_EXE="su"
    if [ -f "$ROOTFS/bin/su" ]; then SU_EXE="/bin/su"; elif [ -f "$ROOTFS/usr/bin/su" ]; then SU_EXE="/usr/bin/su"; fi
    exec /usr/sbin/chroot "$ROOTFS" "$SU_EXE" -m "$USER" -c "export HOME=${HOME:-/home/$USER}; export TERM=${TERM:-xterm}; $CD_CMD exec \"\$@\"" sh "$@"
  else
    exec /usr/sbin/chroot "$ROOTFS" /bin/sh -c "$CD_CMD exec \"\$@\"" sh "$@"
  fi
fi
"#;

/// Shell snippet that writes the shim to its install path from stdin.
///
/// Used as `run_with_input(SHIM_SCRIPT, ["sh", "-c", install_command()])`.
pub fn install_command() -> String {
    format!("cat > {p} && chmod +x {p}", p = SHIM_PATH)
}

/// Sentinel used for empty `mounts`/`workdir`/`user` shim arguments.
pub const NONE_ARG: &str = "none";

/// Builds the full launch argv for a container.
///
/// `ip netns exec <id>` puts the tree into the container's network
/// namespace; `unshare --mount --pid --fork --uts` gives it private
/// mount/PID/hostname namespaces; the shim does the rest.
pub fn launch_argv(
    container_id: &str,
    rootfs: &str,
    mounts: &str,
    workdir: &str,
    user: &str,
    pid_file: &str,
    cmd: &[String],
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "ip".into(),
        "netns".into(),
        "exec".into(),
        container_id.into(),
    ];
    argv.extend(unshare_argv(rootfs, mounts, workdir, user, pid_file, cmd));
    argv
}

/// The `unshare …` tail of the launch argv, without the netns wrapper.
///
/// The detached launcher script re-enters the netns itself, so it only
/// needs this portion.
pub fn unshare_argv(
    rootfs: &str,
    mounts: &str,
    workdir: &str,
    user: &str,
    pid_file: &str,
    cmd: &[String],
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "unshare".into(),
        "--mount".into(),
        "--pid".into(),
        "--fork".into(),
        "--uts".into(),
        "/bin/sh".into(),
        SHIM_PATH.into(),
        rootfs.into(),
        mounts.into(),
        workdir.into(),
        user.into(),
        pid_file.into(),
    ];
    argv.extend(cmd.iter().cloned());
    argv
}

/// Renders the detached launcher (`run.sh`) body.
///
/// The launcher executes the unshare argv with output redirected to
/// `console.log`, then flips the recorded status to `Exited` once the
/// process tree terminates. The status rewrite is a literal `sed` on
/// the JSON text, which is why [`ContainerStatus`] serializes with
/// exactly these bytes.
///
/// [`ContainerStatus`]: crate::container::ContainerStatus
pub fn launcher_script(container_dir: &str, unshare: &[String]) -> String {
    format!(
        "#!/bin/sh\n{cmd} > {dir}/console.log 2>&1\nsed -i 's/\"status\":\"Running\"/\"status\":\"Exited\"/g' {dir}/config.json\n",
        cmd = shell_join(unshare),
        dir = container_dir,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shim_refuses_empty_rootfs() {
        assert!(SHIM_SCRIPT.contains(r#"if [ -z "$ROOTFS" ]"#));
        assert!(SHIM_SCRIPT.contains("Refusing to continue"));
    }

    #[test]
    fn test_shim_mount_set() {
        for needle in [
            "mount -t proc proc",
            "mount -t sysfs sysfs",
            "mount --rbind /dev",
            "mount -t devpts devpts",
            r#"mount -t tmpfs tmpfs "$ROOTFS/dev/shm""#,
            r#"mount -t tmpfs tmpfs "$ROOTFS/tmp""#,
        ] {
            assert!(SHIM_SCRIPT.contains(needle), "missing: {needle}");
        }
    }

    #[test]
    fn test_shim_dns_fallback() {
        assert!(SHIM_SCRIPT.contains("nameserver 8.8.8.8"));
    }

    #[test]
    fn test_shim_appends_hosts_extra() {
        assert!(SHIM_SCRIPT.contains("hosts-extra"));
    }

    #[test]
    fn test_launch_argv_shape() {
        let argv = launch_argv(
            "c-1234",
            "/var/lib/pocketlinx/containers/c-1234/rootfs",
            "none",
            "none",
            "none",
            "/var/lib/pocketlinx/containers/c-1234/shim.pid",
            &["echo".to_string(), "hi".to_string()],
        );
        assert_eq!(&argv[..4], &["ip", "netns", "exec", "c-1234"]);
        assert!(argv.contains(&"unshare".to_string()));
        assert!(argv.contains(&SHIM_PATH.to_string()));
        assert_eq!(&argv[argv.len() - 2..], &["echo", "hi"]);
    }

    #[test]
    fn test_launcher_script_rewrites_status() {
        let script = launcher_script(
            "/var/lib/pocketlinx/containers/c-1",
            &["unshare".to_string(), "--mount".to_string()],
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("console.log"));
        assert!(script.contains(r#"s/"status":"Running"/"status":"Exited"/g"#));
    }

    #[test]
    fn test_launcher_script_quotes_args() {
        let script = launcher_script(
            "/d",
            &["sh".to_string(), "-c".to_string(), "echo 'it'".to_string()],
        );
        assert!(script.contains(r"'echo '\''it'\'''"));
    }
}

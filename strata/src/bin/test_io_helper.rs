//! Test helper binary for precise I/O testing.
//!
//! Sets its process comm to a specific name and performs exactly one I/O
//! operation, so integration tests can filter the event stream for a unique
//! comm and assert exact byte counts.
//!
//! Usage:
//!   test_io_helper <comm> read <file> <bytes>
//!   test_io_helper <comm> read_direct <file> <bytes>  # O_DIRECT, bypasses cache
//!   test_io_helper <comm> write <file> <bytes>
//!   test_io_helper <comm> write_sync <file> <bytes>   # write followed by fsync

use std::env;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::ExitCode;

fn set_comm(name: &str) -> std::io::Result<()> {
    // PR_SET_NAME = 15
    const PR_SET_NAME: libc::c_int = 15;

    // Comm is limited to 16 bytes including the NUL.
    let mut comm_bytes = [0u8; 16];
    let name_bytes = name.as_bytes();
    let len = name_bytes.len().min(15);
    comm_bytes[..len].copy_from_slice(&name_bytes[..len]);

    let result = unsafe { libc::prctl(PR_SET_NAME, comm_bytes.as_ptr()) };

    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn do_read(path: &str, bytes: usize) -> std::io::Result<()> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(0))?;
    let mut buffer = vec![0u8; bytes];
    file.read_exact(&mut buffer)?;
    Ok(())
}

fn do_read_direct(path: &str, bytes: usize) -> std::io::Result<()> {
    // O_DIRECT requires page-aligned buffers and sizes.
    let c_path = std::ffi::CString::new(path).unwrap();
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECT) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    use std::alloc::{alloc, dealloc, Layout};
    let align = 4096;
    let size = bytes.div_ceil(align) * align;
    let layout = Layout::from_size_align(size, align)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

    let buffer = unsafe { alloc(layout) };
    if buffer.is_null() {
        unsafe { libc::close(fd) };
        return Err(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "aligned alloc failed",
        ));
    }

    let result = unsafe { libc::read(fd, buffer as *mut libc::c_void, size) };
    unsafe {
        dealloc(buffer, layout);
        libc::close(fd);
    }

    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn do_write(path: &str, bytes: usize, sync: bool) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    let buffer = vec![0x42u8; bytes];
    file.write_all(&buffer)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 5 {
        eprintln!(
            "Usage: {} <comm> <read|read_direct|write|write_sync> <file> <bytes>",
            args.first().map(|s| s.as_str()).unwrap_or("test_io_helper")
        );
        return ExitCode::from(1);
    }

    let comm = &args[1];
    let operation = &args[2];
    let file_path = &args[3];
    let bytes: usize = match args[4].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Invalid byte count: {}", args[4]);
            return ExitCode::from(1);
        }
    };

    // Set the comm first so every syscall below is attributed to it.
    if let Err(e) = set_comm(comm) {
        eprintln!("Failed to set comm: {}", e);
        return ExitCode::from(1);
    }

    let result = match operation.as_str() {
        "read" => do_read(file_path, bytes),
        "read_direct" => do_read_direct(file_path, bytes),
        "write" => do_write(file_path, bytes, false),
        "write_sync" => do_write(file_path, bytes, true),
        _ => {
            eprintln!(
                "Unknown operation: {} (use 'read', 'read_direct', 'write', or 'write_sync')",
                operation
            );
            return ExitCode::from(1);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} failed: {}", operation, e);
            ExitCode::from(1)
        }
    }
}

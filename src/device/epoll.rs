// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A minimal single-threaded poller over exactly the fds the engine cares
//! about: the TUN device and the UDP socket. There is no notifier, no
//! signal handling, and no per-event registry, because there is only ever
//! one thread driving the loop and only ever two fds to watch.

use super::Error;
use libc::*;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Which watched fd became readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    Tun,
    Udp,
    /// Poll timed out with nothing ready; the caller should still drive its
    /// timers forward.
    Timeout,
}

pub struct Poller {
    epoll: RawFd,
    tun_fd: RawFd,
    udp_fd: RawFd,
}

impl Poller {
    pub fn new(tun_fd: RawFd, udp_fd: RawFd) -> Result<Poller, Error> {
        let epoll = match unsafe { epoll_create1(0) } {
            -1 => return Err(Error::EventQueue(io::Error::last_os_error())),
            fd => fd,
        };

        let poller = Poller {
            epoll,
            tun_fd,
            udp_fd,
        };
        poller.register(tun_fd)?;
        poller.register(udp_fd)?;
        Ok(poller)
    }

    fn register(&self, fd: RawFd) -> Result<(), Error> {
        let mut event = epoll_event {
            events: (EPOLLIN | EPOLLET) as u32,
            u64: fd as u64,
        };
        if unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(Error::EventQueue(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Blocks for up to `timeout`, returning which fd (if any) became
    /// readable. The event loop is expected to drain each fd fully before
    /// calling this again, since edge-triggered mode only fires once per
    /// readability transition.
    pub fn wait(&self, timeout: Duration) -> Result<Readable, Error> {
        let mut events: [epoll_event; 2] = unsafe { std::mem::zeroed() };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe { epoll_wait(self.epoll, events.as_mut_ptr(), 2, millis) };
        match n {
            -1 => Err(Error::EventQueue(io::Error::last_os_error())),
            0 => Ok(Readable::Timeout),
            _ => {
                let fd = events[0].u64 as RawFd;
                if fd == self.tun_fd {
                    Ok(Readable::Tun)
                } else {
                    Ok(Readable::Udp)
                }
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { close(self.epoll) };
    }
}

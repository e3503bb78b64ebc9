use core::iter::from_fn;

use alloc::{sync::Arc, vec, vec::Vec};
use log::debug;

use crate::{
    error::{Result, ensure, err},
    fs::{
        Custody,
        fd::FileDescriptor,
        path::Path,
        unveil::{UnveilAccess, UnveilData},
    },
    user::{
        memory::VirtualMemory,
        registry::ProcessRegistry,
        syscall::args::{FileMode, OpenFlags},
        thread::{Sigaction, Thread},
    },
};

use super::{Process, ProcessState, STACK_SIZE, pledge::Promises};

/// The maximum number of interpreters that may be chained by one exec.
pub const EXEC_RECURSION_LIMIT: usize = 2;

/// Maps program images into an address space.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, custody: &Custody, file: &FileDescriptor, memory: &VirtualMemory)
    -> Result<LoadedImage>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedImage {
    /// The program was loaded and starts executing at `entry`.
    Program { entry: u64 },
    /// The file has to be run by an interpreter instead.
    Interpreter {
        path: Path,
        arguments: Vec<Vec<u8>>,
    },
}

impl LoadedImage {
    /// Parse a `#!` line.
    pub fn from_shebang(bytes: &[u8]) -> Result<Self> {
        let bytes = bytes.strip_prefix(b"#!").ok_or(err!(NoExec))?;
        let line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();

        let mut line = Some(line);
        let mut args = from_fn(|| {
            let bs = line.as_mut()?;
            while let Some(rest) = bs.strip_prefix(b" ") {
                *bs = rest;
            }
            if bs.is_empty() {
                line = None;
                return None;
            }

            let end = bs.iter().position(|&b| b == b' ').unwrap_or(bs.len());
            let arg = bs[..end].to_vec();
            *bs = &bs[end..];
            Some(arg)
        });

        let path = args.next().ok_or(err!(NoExec))?;
        let path = Path::new(&path)?;
        Ok(Self::Interpreter {
            path,
            arguments: args.collect(),
        })
    }
}

impl Process {
    /// Replace the running program.
    ///
    /// Either the new program is fully set up, or nothing about the process
    /// changes. On success, `caller` is the only thread left and continues
    /// at the new program's entry point.
    pub fn exec(
        &self,
        registry: &ProcessRegistry,
        caller: &Thread,
        loader: &dyn ProgramLoader,
        path: &Path,
        arguments: Vec<Vec<u8>>,
        environment: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.require_promise(Promises::EXEC)?;
        ensure!(self.state() == ProcessState::Running, Srch);

        let ctx = self.file_access_context();
        let mut path = self.absolute_path(path);
        let mut arguments = arguments;
        let mut depth = 0;

        let (program, memory, entry) = loop {
            let custody = self.vfs_root.vfs().resolve(&path, &ctx)?;
            self.check_unveil(custody.path(), UnveilAccess::EXECUTE)?;
            ensure!(!custody.is_dir(), Acces);
            ensure!(custody.metadata().mode.is_executable(), Acces);

            let file = self.vfs_root.vfs().open(&custody, OpenFlags::empty(), &ctx)?;
            let memory = VirtualMemory::new();
            match loader.load(&custody, &file, &memory)? {
                LoadedImage::Program { entry } => break (custody, memory, entry),
                LoadedImage::Interpreter {
                    path: interpreter,
                    arguments: interpreter_arguments,
                } => {
                    depth += 1;
                    ensure!(depth <= EXEC_RECURSION_LIMIT, Loop);

                    let mut new_arguments = vec![interpreter.to_bytes()];
                    new_arguments.extend(interpreter_arguments);
                    new_arguments.push(custody.path().to_bytes());
                    new_arguments.extend(arguments.into_iter().skip(1));
                    arguments = new_arguments;
                    path = self.absolute_path(&interpreter);
                }
            }
        };
        let stack = memory.allocate_stack(STACK_SIZE)?;

        // Nothing below may fail.

        let metadata = *program.metadata();
        // Interpreted programs don't run with elevated privileges.
        let set_user_id = (depth == 0 && metadata.mode.contains(FileMode::SET_USER_ID))
            .then_some(metadata.uid);
        let set_group_id = (depth == 0 && metadata.mode.contains(FileMode::SET_GROUP_ID))
            .then_some(metadata.gid);

        self.with_mutable_protected_data(|values, window| {
            values.pledge.update(window, |pledge| pledge.after_exec());
            for cell in values.signal_actions.iter() {
                cell.update(window, Sigaction::after_exec);
            }
            if set_user_id.is_some() || set_group_id.is_some() {
                let credentials = values
                    .credentials
                    .cloned()
                    .with_executable_owner(set_user_id, set_group_id);
                values.credentials.set(window, Arc::new(credentials));
                values.dumpable.set(window, false);
            }
        });

        {
            let mut current = self.unveil.lock();
            let mut after_exec = self.exec_unveil.lock();
            UnveilData::exec(&mut current, &mut after_exec);
        }
        self.fdtable.close_on_exec();

        *self.memory.lock() = Some(Arc::new(memory));
        if let Some(name) = program.path().file_name() {
            self.set_name(name.as_ref());
        }
        debug!(
            "process {} executing {} at {entry:#x}",
            self.pid,
            program.path()
        );
        *self.executable.lock() = Some(program);
        *self.arguments.lock() = arguments;
        *self.environment.lock() = environment;

        for thread in self.threads() {
            if thread.tid() == caller.tid() {
                continue;
            }
            thread.exit(registry, 0);
            registry.remove_thread(thread.tid());
        }
        caller.reset_image(entry, stack);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{format, string::ToString, vec, vec::Vec};

    use super::{EXEC_RECURSION_LIMIT, LoadedImage};
    use crate::{
        error::ErrorKind,
        fs::{
            fd::FileDescriptorTable,
            path::Path,
            unveil::{UnveilAccess, UnveilTarget, VeilState},
        },
        testing::{Fixture, NullFile, fixture},
        user::{
            process::{ProcessInternals, credentials::Uid, pledge::Promises},
            syscall::args::{FdFlags, FileMode, Signal},
            thread::{SigHandler, Sigaction},
        },
    };

    fn path(path: &str) -> Path {
        Path::new(path.as_bytes()).unwrap()
    }

    fn args(args: &[&str]) -> Vec<Vec<u8>> {
        args.iter().map(|arg| arg.as_bytes().to_vec()).collect()
    }

    #[test]
    fn shebang_lines_are_split() {
        let image = LoadedImage::from_shebang(b"#! /bin/sh -e\necho hi\n").unwrap();
        assert_eq!(
            image,
            LoadedImage::Interpreter {
                path: path("/bin/sh"),
                arguments: args(&["-e"]),
            }
        );
        assert_eq!(
            LoadedImage::from_shebang(b"\x7fELF").unwrap_err(),
            ErrorKind::NoExec
        );
        assert_eq!(LoadedImage::from_shebang(b"#!\n").unwrap_err(), ErrorKind::NoExec);
    }

    #[test]
    fn exec_applies_exec_promises_and_veil() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_program("/bin/ls", &loader, 0x4000);
        let process = thread.process();
        process
            .pledge(
                Some(Promises::STDIO | Promises::EXEC | Promises::RPATH),
                Some(Promises::STDIO | Promises::RPATH),
            )
            .unwrap();
        process
            .veil(UnveilTarget::Current)
            .unveil(&path("/bin"), UnveilAccess::EXECUTE)
            .unwrap();
        process
            .veil(UnveilTarget::AfterExec)
            .unveil(&path("/etc"), UnveilAccess::READ)
            .unwrap();
        process.veil(UnveilTarget::AfterExec).lock().unwrap();

        process
            .exec(&registry, &thread, &loader, &path("/bin/ls"), args(&["ls"]), vec![])
            .unwrap();

        let pledge = process.pledge_state();
        assert_eq!(pledge.promises(), Some(Promises::STDIO | Promises::RPATH));
        assert_eq!(pledge.exec_promises(), None);
        assert_eq!(
            process.require_promise(Promises::EXEC).unwrap_err(),
            ErrorKind::Perm
        );

        let veil = process.veil(UnveilTarget::Current);
        assert_eq!(veil.state(), VeilState::LockedInherited);
        assert!(veil.check(&path("/etc/hosts"), UnveilAccess::READ).is_ok());
        assert!(veil.check(&path("/bin/ls"), UnveilAccess::EXECUTE).is_err());
        drop(veil);
        assert_eq!(
            process.veil(UnveilTarget::AfterExec).state(),
            VeilState::None
        );

        assert_eq!(thread.entry(), 0x4000);
        assert_eq!(process.name().as_slice(), b"ls");
        assert_eq!(process.executable().unwrap().path(), &path("/bin/ls"));
    }

    #[test]
    fn inherited_locks_survive_exec() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_program("/bin/sh", &loader, 0x1000);
        let process = thread.process();
        {
            let mut veil = process.veil(UnveilTarget::AfterExec);
            veil.unveil(&path("/bin"), UnveilAccess::READ | UnveilAccess::EXECUTE)
                .unwrap();
            veil.lock().unwrap();
        }
        let sh = path("/bin/sh");
        process
            .exec(&registry, &thread, &loader, &sh, args(&["sh"]), vec![])
            .unwrap();

        // The new program prepares another veil, but the inherited one stays.
        process
            .veil(UnveilTarget::AfterExec)
            .unveil(&path("/"), UnveilAccess::all())
            .unwrap();
        process
            .exec(&registry, &thread, &loader, &sh, args(&["sh"]), vec![])
            .unwrap();
        let veil = process.veil(UnveilTarget::Current);
        assert_eq!(veil.state(), VeilState::LockedInherited);
        assert!(veil.check(&path("/etc"), UnveilAccess::READ).is_err());
    }

    #[test]
    fn interpreters_are_followed_up_to_the_limit() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_program("/bin/sh", &loader, 0x7000);
        vfs.add_script("/usr/bin/tool", b"#!/bin/sh -e\n");
        let process = thread.process();

        process
            .exec(
                &registry,
                &thread,
                &loader,
                &path("/usr/bin/tool"),
                args(&["tool", "--help"]),
                vec![],
            )
            .unwrap();
        assert_eq!(thread.entry(), 0x7000);
        assert_eq!(
            process.arguments(),
            args(&["/bin/sh", "-e", "/usr/bin/tool", "--help"])
        );

        // Every script runs the next one.
        let mut previous = "/bin/sh".to_string();
        for i in 0..=EXEC_RECURSION_LIMIT {
            let name = format!("/tmp/loop{i}");
            vfs.add_script(&name, format!("#!{previous}\n").as_bytes());
            previous = name;
        }
        let name = process.name();
        assert_eq!(
            process
                .exec(&registry, &thread, &loader, &path(&previous), args(&["x"]), vec![])
                .unwrap_err(),
            ErrorKind::Loop
        );
        assert_eq!(process.name(), name);
        assert_eq!(thread.entry(), 0x7000);
    }

    #[test]
    fn exec_requires_the_promise_and_unveiled_program() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_program("/bin/ls", &loader, 0x4000);
        let process = thread.process();

        process
            .veil(UnveilTarget::Current)
            .unveil(&path("/bin"), UnveilAccess::READ)
            .unwrap();
        assert_eq!(
            process
                .exec(&registry, &thread, &loader, &path("/bin/ls"), args(&["ls"]), vec![])
                .unwrap_err(),
            ErrorKind::Perm
        );

        process.pledge(Some(Promises::STDIO), None).unwrap();
        assert_eq!(
            process
                .exec(&registry, &thread, &loader, &path("/bin/ls"), args(&["ls"]), vec![])
                .unwrap_err(),
            ErrorKind::Perm
        );
        assert_eq!(
            process
                .exec(&registry, &thread, &loader, &path("/nope"), args(&["x"]), vec![])
                .unwrap_err(),
            ErrorKind::Perm
        );
    }

    #[test]
    fn exec_resets_handlers_descriptors_and_threads() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_program("/bin/ls", &loader, 0x4000);
        let process = thread.process();

        let handler = Sigaction {
            handler: SigHandler::Handler(0x1234),
            ..Sigaction::DEFAULT
        };
        let ignore = Sigaction {
            handler: SigHandler::Ignore,
            ..Sigaction::DEFAULT
        };
        process.sigaction(Signal::USR1, Some(handler)).unwrap();
        process.sigaction(Signal::USR2, Some(ignore)).unwrap();

        let limit = process.fd_limit();
        let table: &FileDescriptorTable = process.fdtable();
        let kept = table.insert(NullFile::new(), FdFlags::empty(), limit).unwrap();
        let closed = table.insert(NullFile::new(), FdFlags::CLOEXEC, limit).unwrap();

        let worker = process.create_thread(&registry, 0x2000, None).unwrap();
        let old_memory = process.address_space().unwrap();

        process
            .exec(&registry, &thread, &loader, &path("/bin/ls"), args(&["ls"]), vec![])
            .unwrap();

        assert_eq!(process.sigaction(Signal::USR1, None).unwrap(), Sigaction::DEFAULT);
        assert_eq!(process.sigaction(Signal::USR2, None).unwrap(), ignore);
        assert!(table.get(kept).is_ok());
        assert_eq!(table.get(closed).unwrap_err(), ErrorKind::BadF);
        assert!(registry.thread(worker.tid()).is_none());
        assert_eq!(process.thread_count(), 1);
        assert_ne!(process.address_space().unwrap().id(), old_memory.id());
    }

    #[test]
    fn set_user_id_programs_change_credentials() {
        let Fixture {
            registry,
            thread,
            vfs,
            loader,
        } = fixture();
        vfs.add_file_with(
            "/bin/passwd",
            FileMode::OWNER_ALL | FileMode::OTHER_EXECUTE | FileMode::SET_USER_ID,
            Uid::new(0),
        );
        loader.add_program("/bin/passwd", 0x4000);
        let process = thread.process();
        process.set_dumpable(true);

        process
            .exec(&registry, &thread, &loader, &path("/bin/passwd"), args(&["passwd"]), vec![])
            .unwrap();
        let credentials = process.credentials();
        assert_eq!(credentials.effective_user_id, Uid::new(0));
        assert_eq!(credentials.real_user_id, Uid::new(1000));
        assert!(!process.is_dumpable());
    }
}

/// State accumulated across one file transfer, owned by [`Propagator::push_entry`]
/// so every exit path can settle temp files and the resume record.
struct FileCopy {
    hbf: HbfInfo,
    record: Option<ResumeRecord>,
    /// Temp destination, when the temp-file strategy is in use.
    turi: Option<String>,
    /// Ownership of the temp file was handed to the resume record; cleanup
    /// must not unlink it.
    tmp_detached: bool,
}

impl FileCopy {
    fn new(record: Option<ResumeRecord>) -> Self {
        Self {
            hbf: HbfInfo::default(),
            record,
            turi: None,
            tmp_detached: false,
        }
    }
}

/// How one transfer attempt ended short of success.
enum PushFail {
    /// Recorded on the entry; the driver continues.
    Soft(VioError),
    /// Stops the whole run.
    Fatal(VioError),
    /// Source changed underneath us; silent skip, no writeback change.
    Skip,
}

fn fail_by_kind(err: VioError) -> PushFail {
    match err.kind {
        VioErrorKind::NoMemory | VioErrorKind::UserAbort => PushFail::Fatal(err),
        _ => PushFail::Soft(err),
    }
}

impl Propagator {
    /// Transfer one file from `side` to the opposite replica.
    pub(crate) async fn push_entry(
        &mut self,
        side: Side,
        phash: u64,
        trees: &mut SyncTrees,
    ) -> Result<OpStatus, PropagateError> {
        let Some(snapshot) = trees.tree(side).get(phash) else {
            return Ok(OpStatus::Done);
        };
        let mut entry = snapshot.clone();

        let (record, skip) = self.preflight(&entry).await?;
        if skip {
            return self.blacklist_skip(trees, side, entry, record).await;
        }

        let dst_side = side.other();
        let (start_kind, end_kind) = match side {
            Side::Local => (ProgressKind::StartUpload, ProgressKind::FinishedUpload),
            Side::Remote => (ProgressKind::StartDownload, ProgressKind::FinishedDownload),
        };
        let adjusted = self.renames.adjust(&entry.path);

        self.overall.current_file_no += 1;
        self.notify(start_kind, Some(&adjusted), 0, entry.size);

        let mut xfer = FileCopy::new(record);
        let result = self
            .push_file(side, dst_side, &adjusted, &mut entry, &mut xfer)
            .await;

        match result {
            Ok(()) => {
                self.journal.delete(entry.phash).await?;
                entry.applied = Some(Applied::Updated);
                self.overall.byte_current += entry.size;
                self.notify(end_kind, Some(&adjusted), entry.size, entry.size);
                eprintln!(
                    "[driftsync] pushed file: {}",
                    self.vio.display(dst_side, &adjusted)
                );
                trees.tree_mut(side).replace(entry);
                Ok(OpStatus::Done)
            }
            Err(PushFail::Skip) => {
                eprintln!(
                    "[driftsync] file: {}, source changed since reconciliation, skipped",
                    entry.path
                );
                Ok(OpStatus::Soft)
            }
            Err(PushFail::Soft(err)) => {
                self.settle_failed_copy(dst_side, &xfer).await;
                self.status = classify(err.kind).0;
                self.record_error(trees, &mut entry, &err.to_string(), xfer.record.take())
                    .await?;
                trees.tree_mut(side).replace(entry);
                Ok(OpStatus::Soft)
            }
            Err(PushFail::Fatal(err)) => {
                self.settle_failed_copy(dst_side, &xfer).await;
                self.status = classify(err.kind).0;
                self.error_string = Some(err.to_string());
                self.record_error(trees, &mut entry, &err.to_string(), xfer.record.take())
                    .await?;
                trees.tree_mut(side).replace(entry);
                Err(PropagateError::Fatal(err))
            }
        }
    }

    /// Drop a failed transfer's temp file unless its ownership moved to the
    /// resume record.
    async fn settle_failed_copy(&self, dst_side: Side, xfer: &FileCopy) {
        if xfer.tmp_detached {
            return;
        }
        if let Some(turi) = &xfer.turi {
            let _ = self.vio.unlink(dst_side, turi).await;
        }
    }

    async fn push_file(
        &mut self,
        side: Side,
        dst_side: Side,
        adjusted: &str,
        entry: &mut Entry,
        xfer: &mut FileCopy,
    ) -> Result<(), PushFail> {
        if let Some(record) = &xfer.record {
            eprintln!(
                "[driftsync] continuation: chunk {} transfer {}",
                record.chunk, record.transfer_id
            );
            xfer.hbf.start_chunk = record.chunk;
            xfer.hbf.transfer_id = record.transfer_id;
        }

        // Check that the source is still untouched since the update run.
        if side == Side::Local {
            let stat = self
                .vio
                .stat(Side::Local, adjusted)
                .await
                .map_err(PushFail::Soft)?;
            if stat.mtime != entry.modtime || stat.size != entry.size {
                return Err(PushFail::Skip);
            }
        }

        // O_NOATIME can only be set by the owner of the file or root.
        let noatime = entry.uid == self.config.uid || self.config.euid == 0;
        let mut src = match self.vio.open_read(side, adjusted, noatime).await {
            Ok(handle) => handle,
            Err(err) => {
                eprintln!(
                    "[driftsync] file: {}, command: open, error: {}",
                    self.vio.display(side, adjusted),
                    err
                );
                return Err(fail_by_kind(err));
            }
        };

        // Push through a temp name unless the destination is remote and
        // overwrites atomically.
        let push_tmp = dst_side == Side::Local || !self.caps(dst_side).atomic_overwrite;

        let mut turi = if push_tmp {
            String::new()
        } else {
            adjusted.to_string()
        };
        let mut dst: Option<VioHandle> = None;
        if push_tmp {
            if let Some(record) = &xfer.record
                && let Some(tmp) = record.tmpfile.clone()
                && !tmp.is_empty()
            {
                // Try to resume into the preserved partial.
                if let Ok(handle) = self.vio.open_append(dst_side, &tmp).await {
                    dst = Some(handle);
                    turi = tmp;
                }
            }
            if dst.is_none() {
                turi = paths::tmp_name(adjusted);
            }
        }

        let mut dst = match dst {
            Some(handle) => {
                xfer.turi = Some(turi.clone());
                handle
            }
            None => {
                let handle = self
                    .create_destination(dst_side, adjusted, &mut turi, push_tmp)
                    .await?;
                if push_tmp {
                    xfer.turi = Some(turi.clone());
                }
                handle
            }
        };

        // Copy the data: bulk primitives first, then chunked streaming, then
        // a plain buffered loop.
        let mut transmitted = false;
        if self.remote_caps.put_support && side == Side::Local {
            if let Err(err) = self.vio.put(&src, &mut dst).await {
                eprintln!(
                    "[driftsync] file: {}, command: put, error: {}",
                    self.vio.display(dst_side, &turi),
                    err
                );
                return Err(fail_by_kind(err));
            }
            transmitted = true;
        }
        if !transmitted && self.remote_caps.get_support && side == Side::Remote {
            if let Err(err) = self.vio.get(&mut dst, &mut src).await {
                eprintln!(
                    "[driftsync] file: {}, command: get, error: {}",
                    self.vio.display(dst_side, &turi),
                    err
                );
                return Err(fail_by_kind(err));
            }
            transmitted = true;
        }
        if !transmitted && self.remote_caps.use_sendfile {
            if let Err(err) = self.vio.sendfile(&mut src, &mut dst, &mut xfer.hbf).await {
                eprintln!(
                    "[driftsync] file: {}, command: sendfile, error: {}",
                    self.vio.display(side, adjusted),
                    err
                );
                self.preserve_resume_state(dst_side, &turi, push_tmp, &err, entry, xfer)
                    .await;
                return Err(fail_by_kind(err));
            }
            transmitted = true;
        }
        if !transmitted {
            let mut buf = vec![0u8; XFER_BUF_SIZE];
            loop {
                let n = match self.vio.read(&mut src, &mut buf).await {
                    Ok(n) => n,
                    Err(err) => {
                        eprintln!(
                            "[driftsync] file: {}, command: read, error: {}",
                            self.vio.display(side, adjusted),
                            err
                        );
                        return Err(fail_by_kind(err));
                    }
                };
                if n == 0 {
                    break;
                }
                if let Err(err) = self.vio.write(&mut dst, &buf[..n]).await {
                    eprintln!(
                        "[driftsync] file: {}, command: write, error: {}",
                        self.vio.display(dst_side, &turi),
                        err
                    );
                    return Err(fail_by_kind(err));
                }
            }
        }

        if let Err(err) = self.vio.close(src).await {
            eprintln!(
                "[driftsync] file: {}, command: close, error: {}",
                self.vio.display(side, adjusted),
                err
            );
        }
        if let Err(err) = self.vio.close(dst).await {
            eprintln!(
                "[driftsync] file: {}, command: close, error: {}",
                self.vio.display(dst_side, &turi),
                err
            );
            if close_severity(err.kind) == Severity::Fatal {
                return Err(PushFail::Fatal(err));
            }
            // The write may still be valid for some transports; let the
            // post-copy stat decide.
            self.status = classify(err.kind).0;
        }

        if self.caps(dst_side).do_post_copy_stat {
            let tstat = match self.vio.stat(dst_side, &turi).await {
                Ok(stat) => stat,
                Err(err) => {
                    eprintln!(
                        "[driftsync] file: {}, command: stat, error: {}",
                        self.vio.display(dst_side, &turi),
                        err
                    );
                    return Err(fail_by_kind(err));
                }
            };
            if tstat.size != entry.size {
                let message = format!(
                    "{}: incorrect file size {} (expected {})",
                    turi, tstat.size, entry.size
                );
                eprintln!("[driftsync] {message}");
                return Err(PushFail::Soft(VioError::new(
                    VioErrorKind::General,
                    message,
                )));
            }
            if entry.fingerprint.is_none() && tstat.file_id.is_some() {
                entry.fingerprint = tstat.file_id;
            }
        }

        if push_tmp {
            if let Err(err) = self.vio.rename(dst_side, &turi, adjusted).await {
                eprintln!(
                    "[driftsync] file: {}, command: rename, error: {}",
                    self.vio.display(dst_side, adjusted),
                    err
                );
                return Err(fail_by_kind(err));
            }
        }

        if entry.mode & 0o7777 != DEFAULT_FILE_MODE {
            if let Err(err) = self.vio.chmod(dst_side, adjusted, entry.mode).await {
                eprintln!(
                    "[driftsync] file: {}, command: chmod, error: {}",
                    self.vio.display(dst_side, adjusted),
                    err
                );
                return Err(fail_by_kind(err));
            }
        }
        if self.config.euid == 0 {
            let _ = self
                .vio
                .chown(dst_side, adjusted, entry.uid, entry.gid)
                .await;
        }
        let _ = self.vio.set_mtime(dst_side, adjusted, entry.modtime).await;

        // Setting the mtime changes the server-side id again; store the
        // final one.
        if let Ok(Some(id)) = self.vio.file_id(adjusted).await {
            entry.fingerprint = Some(id);
        }

        Ok(())
    }

    /// A failed streaming transfer may still be resumable: keep a non-empty
    /// partial temp, or remember the chunk cursor of a direct write. An I/O
    /// failure is the server discarding the transfer, so the partial is
    /// worthless and gets dropped.
    async fn preserve_resume_state(
        &self,
        dst_side: Side,
        turi: &str,
        push_tmp: bool,
        err: &VioError,
        entry: &Entry,
        xfer: &mut FileCopy,
    ) {
        if push_tmp {
            let worth_keeping = err.kind != VioErrorKind::Io
                && match self.vio.stat(dst_side, turi).await {
                    Ok(stat) => stat.size > 0,
                    Err(_) => false,
                };
            if worth_keeping {
                eprintln!("[driftsync] keeping tmp file: {turi}");
                let record = xfer.record.get_or_insert_with(|| {
                    ResumeRecord::fresh(entry.phash, entry.modtime, entry.fingerprint.clone())
                });
                record.chunk = 0;
                record.tmpfile = Some(turi.to_string());
                record.error = record.error.saturating_mul(2);
                xfer.tmp_detached = true;
            }
        } else {
            eprintln!(
                "[driftsync] remember chunk {} (transfer id {})",
                xfer.hbf.start_chunk, xfer.hbf.transfer_id
            );
            let record = xfer.record.get_or_insert_with(|| {
                ResumeRecord::fresh(entry.phash, entry.modtime, entry.fingerprint.clone())
            });
            record.tmpfile = None;
            record.chunk = xfer.hbf.start_chunk;
            record.transfer_id = xfer.hbf.transfer_id;
        }
    }

    /// Create the destination handle, regenerating the temp name on
    /// collision and creating missing parents. Gives up after ten
    /// collisions, and aborts if the same parent is missing twice in a row.
    async fn create_destination(
        &mut self,
        dst_side: Side,
        adjusted: &str,
        turi: &mut String,
        push_tmp: bool,
    ) -> Result<VioHandle, PushFail> {
        let mut collisions = 0;
        let mut prev_tdir: Option<String> = None;
        loop {
            match self.vio.create(dst_side, turi, push_tmp).await {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    eprintln!(
                        "[driftsync] file: {}, command: create, error: {}",
                        self.vio.display(dst_side, turi),
                        err
                    );
                    match err.kind {
                        VioErrorKind::AlreadyExists => {
                            collisions += 1;
                            if collisions > 10 {
                                self.status = StatusCode::OpenError;
                                return Err(PushFail::Soft(err));
                            }
                            if push_tmp {
                                *turi = paths::tmp_name(adjusted);
                            }
                        }
                        VioErrorKind::NotFound => {
                            let Some(tdir) = paths::parent_of(turi) else {
                                return Err(PushFail::Soft(err));
                            };
                            if prev_tdir.as_deref() == Some(tdir.as_str()) {
                                eprintln!("[driftsync] dir: {tdir}, loop in mkdir detected");
                                return Err(PushFail::Soft(err));
                            }
                            if let Err(mkerr) = self.vio.mkdirs(dst_side, &tdir).await {
                                eprintln!(
                                    "[driftsync] dir: {}, command: mkdirs, error: {}",
                                    tdir, mkerr
                                );
                            }
                            prev_tdir = Some(tdir);
                        }
                        VioErrorKind::NoMemory => return Err(PushFail::Fatal(err)),
                        _ => return Err(PushFail::Soft(err)),
                    }
                }
            }
        }
    }
}

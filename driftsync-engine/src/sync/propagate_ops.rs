impl Propagator {
    /// Remove a file on its own replica. A failure writes back `None`
    /// rather than `Error` so the statedb still records the path and the
    /// removal is retried next sync.
    pub(crate) async fn remove_file(
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
            let message = record
                .as_ref()
                .and_then(|record| record.error_string.clone())
                .unwrap_or_else(|| "too many failed attempts".to_string());
            self.record_error(trees, &mut entry, &message, record).await?;
            entry.applied = Some(Applied::None);
            trees.tree_mut(side).replace(entry);
            return Ok(OpStatus::Soft);
        }

        let target = match side {
            Side::Local => entry.path.clone(),
            Side::Remote => self.renames.adjust(&entry.path),
        };

        self.notify(ProgressKind::StartDelete, Some(&target), 0, entry.size);
        match self.vio.unlink(side, &target).await {
            Ok(()) => {
                entry.applied = Some(Applied::Deleted);
                self.notify(ProgressKind::EndDelete, Some(&target), entry.size, entry.size);
                eprintln!(
                    "[driftsync] removed file: {}",
                    self.vio.display(side, &target)
                );
                trees.tree_mut(side).replace(entry);
                Ok(OpStatus::Done)
            }
            Err(err) => {
                eprintln!(
                    "[driftsync] file: {}, command: unlink, error: {}",
                    self.vio.display(side, &target),
                    err
                );
                self.status = classify(err.kind).0;
                let fatal = matches!(err.kind, VioErrorKind::NoMemory);
                self.record_error(trees, &mut entry, &err.to_string(), record)
                    .await?;
                entry.applied = Some(Applied::None);
                trees.tree_mut(side).replace(entry);
                if fatal {
                    self.error_string = Some(err.to_string());
                    Err(PropagateError::Fatal(err))
                } else {
                    Ok(OpStatus::Soft)
                }
            }
        }
    }

    /// Both sides changed: rename the destination-side copy out of the way,
    /// push the source copy, and drop the backup again if the two turn out
    /// to be identical.
    pub(crate) async fn conflict_file(
        &mut self,
        side: Side,
        phash: u64,
        trees: &mut SyncTrees,
    ) -> Result<OpStatus, PropagateError> {
        let Some(snapshot) = trees.tree(side).get(phash) else {
            return Ok(OpStatus::Done);
        };
        let mut entry = snapshot.clone();
        let dst_side = side.other();

        let stamp = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let backup = paths::conflict_name(&entry.path, stamp);

        if let Err(err) = self.vio.rename(dst_side, &entry.path, &backup).await {
            eprintln!(
                "[driftsync] file: {}, command: rename, error: {}",
                self.vio.display(dst_side, &backup),
                err
            );
            self.status = classify(err.kind).0;
            let fatal = matches!(err.kind, VioErrorKind::NoMemory);
            entry.set_error(&err.to_string());
            trees.mark_parent_error(&entry.path);
            trees.tree_mut(side).replace(entry);
            return if fatal {
                self.error_string = Some(err.to_string());
                Err(PropagateError::Fatal(err))
            } else {
                Ok(OpStatus::Soft)
            };
        }
        eprintln!(
            "[driftsync] backup file: {}",
            self.vio.display(dst_side, &backup)
        );

        let status = self.push_entry(side, phash, trees).await?;

        // When the destination was the local replica both copies are now on
        // disk; erase the backup if there was no real conflict.
        if status == OpStatus::Done && side == Side::Remote {
            match self.vio.local().files_equal(&entry.path, &backup).await {
                Ok(true) => match self.vio.unlink(Side::Local, &backup).await {
                    Ok(()) => eprintln!(
                        "[driftsync] removed conflict backup {backup}: files are equal"
                    ),
                    Err(err) => eprintln!(
                        "[driftsync] remove of conflict backup {backup} failed: {err}"
                    ),
                },
                Ok(false) => {}
                Err(err) => {
                    eprintln!("[driftsync] conflict compare failed for {backup}: {err}");
                }
            }
        }
        Ok(status)
    }

    /// Create (or just re-attribute) a directory on the opposite replica.
    pub(crate) async fn apply_dir(
        &mut self,
        side: Side,
        phash: u64,
        trees: &mut SyncTrees,
        create: bool,
    ) -> Result<OpStatus, PropagateError> {
        let Some(snapshot) = trees.tree(side).get(phash) else {
            return Ok(OpStatus::Done);
        };
        let mut entry = snapshot.clone();

        let (record, skip) = self.preflight(&entry).await?;
        if skip {
            return self.blacklist_skip(trees, side, entry, record).await;
        }

        let dest = side.other();
        let target = match side {
            Side::Local => self.renames.adjust(&entry.path),
            Side::Remote => entry.path.clone(),
        };

        if create
            && let Err(err) = self.vio.mkdirs(dest, &target).await
        {
            eprintln!(
                "[driftsync] dir: {}, command: mkdirs, error: {}",
                self.vio.display(dest, &target),
                err
            );
            return self
                .dir_failed(trees, side, entry, err, record)
                .await;
        }

        if entry.mode & 0o7777 != DEFAULT_DIR_MODE
            && let Err(err) = self.vio.chmod(dest, &target, entry.mode).await
        {
            eprintln!(
                "[driftsync] dir: {}, command: chmod, error: {}",
                self.vio.display(dest, &target),
                err
            );
            return self
                .dir_failed(trees, side, entry, err, record)
                .await;
        }

        if self.config.euid == 0 {
            let _ = self.vio.chown(dest, &target, entry.uid, entry.gid).await;
        }
        let _ = self.vio.set_mtime(dest, &target, entry.modtime).await;

        entry.applied = Some(Applied::Updated);
        eprintln!(
            "[driftsync] {} dir: {}",
            if create { "created" } else { "synced" },
            self.vio.display(dest, &target)
        );
        trees.tree_mut(side).replace(entry);
        Ok(OpStatus::Done)
    }

    async fn dir_failed(
        &mut self,
        trees: &mut SyncTrees,
        side: Side,
        mut entry: Entry,
        err: VioError,
        record: Option<ResumeRecord>,
    ) -> Result<OpStatus, PropagateError> {
        self.status = classify(err.kind).0;
        let fatal = matches!(err.kind, VioErrorKind::NoMemory);
        self.record_error(trees, &mut entry, &err.to_string(), record)
            .await?;
        trees.tree_mut(side).replace(entry);
        if fatal {
            self.error_string = Some(err.to_string());
            Err(PropagateError::Fatal(err))
        } else {
            Ok(OpStatus::Soft)
        }
    }

    /// Remove a directory on its own replica. A not-empty directory is
    /// deferred to the cleanup pass, which runs after all children have had
    /// their chance.
    pub(crate) async fn remove_dir(
        &mut self,
        side: Side,
        phash: u64,
        trees: &mut SyncTrees,
        deferred: &mut Vec<u64>,
    ) -> Result<OpStatus, PropagateError> {
        let Some(snapshot) = trees.tree(side).get(phash) else {
            return Ok(OpStatus::Done);
        };
        let mut entry = snapshot.clone();

        let target = match side {
            Side::Local => entry.path.clone(),
            Side::Remote => self.renames.adjust(&entry.path),
        };

        match self.vio.rmdir(side, &target).await {
            Ok(()) => {
                entry.applied = Some(Applied::Deleted);
                eprintln!(
                    "[driftsync] removed dir: {}",
                    self.vio.display(side, &target)
                );
                trees.tree_mut(side).replace(entry);
                Ok(OpStatus::Done)
            }
            Err(err) if err.kind == VioErrorKind::NotEmpty => {
                deferred.push(phash);
                Ok(OpStatus::Done)
            }
            Err(err) => {
                eprintln!(
                    "[driftsync] dir: {}, command: rmdir, error: {}",
                    self.vio.display(side, &target),
                    err
                );
                self.status = classify(err.kind).0;
                let fatal = matches!(err.kind, VioErrorKind::NoMemory);
                self.remove_error(side, &mut entry).await;
                trees.tree_mut(side).replace(entry);
                if fatal {
                    self.error_string = Some(err.to_string());
                    Err(PropagateError::Fatal(err))
                } else {
                    Ok(OpStatus::Soft)
                }
            }
        }
    }

    /// Apply a rename on the remote replica. The local-tree entry at the
    /// destination path is the partner: it inherits the fingerprint on
    /// success and carries the error bookkeeping on failure, while this
    /// entry is written back `Updated` so the next sync retries the rename.
    pub(crate) async fn rename_entry(
        &mut self,
        side: Side,
        phash: u64,
        trees: &mut SyncTrees,
    ) -> Result<OpStatus, PropagateError> {
        let Some(snapshot) = trees.tree(side).get(phash) else {
            return Ok(OpStatus::Done);
        };
        let mut entry = snapshot.clone();

        let Some(destpath) = entry.destpath.clone() else {
            eprintln!(
                "[driftsync] file: {}, rename failed: destination path empty",
                entry.path
            );
            self.status = StatusCode::ParamError;
            let err = VioError::new(
                VioErrorKind::InvalidArgument,
                format!("{}: rename without destination path", entry.path),
            );
            entry.set_error(&err.message);
            trees.tree_mut(side).replace(entry);
            self.error_string = Some(err.message.clone());
            return Err(PropagateError::Fatal(err));
        };
        let partner_hash = path_hash(&destpath);

        let record = match trees.local.get(partner_hash) {
            Some(partner) => {
                self.journal
                    .get(partner.phash, partner.modtime, partner.fingerprint.as_deref())
                    .await?
            }
            None => None,
        };
        if let Some(limit) = self.config.blacklist_threshold
            && let Some(rec) = &record
            && rec.error > limit
        {
            eprintln!(
                "[driftsync] file: {}, skipped after {} errors: {}",
                entry.path,
                rec.error,
                rec.error_string.as_deref().unwrap_or("unknown error")
            );
            let message = rec
                .error_string
                .clone()
                .unwrap_or_else(|| "too many failed attempts".to_string());
            self.rename_failed(trees, side, entry, partner_hash, &message, record)
                .await?;
            return Ok(OpStatus::Soft);
        }

        if side == Side::Local {
            // The updater never emits local-side renames.
            eprintln!("[driftsync] rename is only supported on the remote replica");
            self.status = StatusCode::ParamError;
            let message = format!("{}: rename on the local replica", entry.path);
            self.rename_failed(trees, side, entry, partner_hash, &message, record)
                .await?;
            self.error_string = Some(message.clone());
            return Err(PropagateError::Fatal(VioError::new(
                VioErrorKind::InvalidArgument,
                message,
            )));
        }

        let suri = self.renames.adjust(&entry.path);
        let duri = self.renames.adjust(&destpath);

        if suri != duri {
            eprintln!("[driftsync] renaming {suri} => {duri}");
            let mut mkdir_tried = false;
            loop {
                match self.vio.rename(Side::Remote, &suri, &duri).await {
                    Ok(()) => break,
                    Err(err) if err.kind == VioErrorKind::NotFound && !mkdir_tried => {
                        mkdir_tried = true;
                        let Some(tdir) = paths::parent_of(&duri) else {
                            self.status = classify(err.kind).0;
                            self.rename_failed(
                                trees,
                                side,
                                entry,
                                partner_hash,
                                &err.to_string(),
                                record,
                            )
                            .await?;
                            return Ok(OpStatus::Soft);
                        };
                        if let Err(mkerr) = self.vio.mkdirs(Side::Remote, &tdir).await {
                            eprintln!(
                                "[driftsync] dir: {}, command: mkdirs, error: {}",
                                tdir, mkerr
                            );
                        }
                    }
                    Err(err) => {
                        eprintln!(
                            "[driftsync] file: {}, command: rename, error: {}",
                            self.vio.display(Side::Remote, &suri),
                            err
                        );
                        self.status = classify(err.kind).0;
                        let fatal =
                            matches!(err.kind, VioErrorKind::NoMemory | VioErrorKind::UserAbort);
                        self.rename_failed(
                            trees,
                            side,
                            entry,
                            partner_hash,
                            &err.to_string(),
                            record,
                        )
                        .await?;
                        return if fatal {
                            self.error_string = Some(err.to_string());
                            Err(PropagateError::Fatal(err))
                        } else {
                            Ok(OpStatus::Soft)
                        };
                    }
                }
            }

            if self.config.euid == 0 {
                let _ = self
                    .vio
                    .chown(Side::Remote, &duri, entry.uid, entry.gid)
                    .await;
            }
            let _ = self.vio.set_mtime(Side::Remote, &duri, entry.modtime).await;
        }

        // Directories keep their fingerprint across a rename; files get a
        // fresh one from the server.
        let fingerprint = if entry.kind == EntryKind::Directory {
            entry.fingerprint.clone()
        } else {
            self.vio.file_id(&duri).await.ok().flatten()
        };
        if let Some(partner) = trees.local.get_mut(partner_hash) {
            partner.fingerprint = fingerprint;
        }
        if entry.kind == EntryKind::Directory {
            self.renames.record(&entry.path, &destpath);
        }

        entry.applied = Some(Applied::Deleted);
        eprintln!("[driftsync] renamed: {} => {}", entry.path, destpath);
        trees.tree_mut(side).replace(entry);
        Ok(OpStatus::Done)
    }

    async fn rename_failed(
        &mut self,
        trees: &mut SyncTrees,
        side: Side,
        mut entry: Entry,
        partner_hash: u64,
        message: &str,
        record: Option<ResumeRecord>,
    ) -> Result<(), PropagateError> {
        entry.set_error(message);
        if let Some(partner) = trees.local.get(partner_hash).cloned() {
            // Retry the rename on the next sync.
            entry.applied = Some(Applied::Updated);
            let mut partner = partner;
            self.record_error(trees, &mut partner, message, record).await?;
            trees.local.replace(partner);
        }
        trees.tree_mut(side).replace(entry);
        Ok(())
    }
}

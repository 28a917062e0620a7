//! In-memory catalog for tests and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use super::{
    Backup, BackupStatus, CatalogStore, Enrollment, EnrollmentStatus, EnrollmentUpdate, Newsletter,
    NewsletterStatus, ProcessingStatus, ReadyEnrollment, SequenceEmail, Video, VideoReady,
};
use crate::error::{LecternError, Result};

#[derive(Debug, Clone)]
struct Subscriber {
    email: String,
    blacklisted: bool,
}

#[derive(Default)]
struct State {
    videos: HashMap<String, Video>,
    newsletters: HashMap<String, Newsletter>,
    subscribers: HashMap<String, Subscriber>,
    sequences: HashMap<String, String>,
    sequence_emails: Vec<SequenceEmail>,
    enrollments: BTreeMap<String, Enrollment>,
    backups: Vec<Backup>,
}

#[derive(Default)]
pub struct InMemoryCatalogStore {
    state: RwLock<State>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_video(&self, video: Video) {
        self.state.write().videos.insert(video.id.clone(), video);
    }

    pub fn video(&self, id: &str) -> Option<Video> {
        self.state.read().videos.get(id).cloned()
    }

    pub fn insert_newsletter(&self, newsletter: Newsletter) {
        self.state.write().newsletters.insert(newsletter.id.clone(), newsletter);
    }

    pub fn newsletter(&self, id: &str) -> Option<Newsletter> {
        self.state.read().newsletters.get(id).cloned()
    }

    pub fn insert_subscriber(&self, id: &str, email: &str, blacklisted: bool) {
        self.state.write().subscribers.insert(
            id.to_string(),
            Subscriber {
                email: email.to_string(),
                blacklisted,
            },
        );
    }

    pub fn insert_sequence(&self, id: &str, name: &str, emails: Vec<SequenceEmail>) {
        let mut state = self.state.write();
        state.sequences.insert(id.to_string(), name.to_string());
        state.sequence_emails.retain(|email| email.sequence_id != id);
        state.sequence_emails.extend(emails);
    }

    pub fn insert_enrollment(&self, enrollment: Enrollment) {
        self.state.write().enrollments.insert(enrollment.id.clone(), enrollment);
    }

    pub fn enrollment(&self, id: &str) -> Option<Enrollment> {
        self.state.read().enrollments.get(id).cloned()
    }

    pub fn backups(&self) -> Vec<Backup> {
        self.state.read().backups.clone()
    }
}

fn update_video(state: &mut State, id: &str, apply: impl FnOnce(&mut Video)) -> Result<()> {
    let video = state
        .videos
        .get_mut(id)
        .ok_or_else(|| LecternError::not_found("video", id))?;
    apply(video);
    Ok(())
}

fn update_backup(state: &mut State, id: Uuid, apply: impl FnOnce(&mut Backup)) -> Result<()> {
    let backup = state
        .backups
        .iter_mut()
        .find(|backup| backup.id == id)
        .ok_or_else(|| LecternError::not_found("backup", id.to_string()))?;
    apply(backup);
    Ok(())
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_video(&self, id: &str) -> Result<Video> {
        self.video(id).ok_or_else(|| LecternError::not_found("video", id))
    }

    async fn mark_video_processing(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        update_video(&mut self.state.write(), id, |video| {
            video.processing_status = ProcessingStatus::Processing;
            video.processing_started_at = Some(at);
            video.processing_error = None;
        })
    }

    async fn mark_video_ready(&self, id: &str, ready: &VideoReady, at: DateTime<Utc>) -> Result<()> {
        update_video(&mut self.state.write(), id, |video| {
            video.processing_status = ProcessingStatus::Ready;
            video.processing_completed_at = Some(at);
            video.processing_error = None;
            video.m3u8 = Some(ready.m3u8.clone());
            video.storage_link = Some(ready.m3u8.clone());
            video.hls_master_key = Some(ready.hls_master_key.clone());
            video.duration = Some(ready.duration);
            video.processing_metadata = Some(ready.metadata.clone());
        })
    }

    async fn mark_video_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        update_video(&mut self.state.write(), id, |video| {
            video.processing_status = ProcessingStatus::Failed;
            video.processing_failed_at = Some(at);
            video.processing_error = Some(error.to_string());
        })
    }

    async fn fail_stale_videos(&self, cutoff: DateTime<Utc>, reason: &str, at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write();
        let mut changed = 0;
        for video in state.videos.values_mut() {
            let stale = video.processing_status == ProcessingStatus::Processing
                && video.processing_started_at.map_or(true, |started| started < cutoff);
            if stale {
                video.processing_status = ProcessingStatus::Failed;
                video.processing_failed_at = Some(at);
                video.processing_error = Some(reason.to_string());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_newsletter(&self, id: &str) -> Result<Newsletter> {
        self.newsletter(id).ok_or_else(|| LecternError::not_found("newsletter", id))
    }

    async fn append_delivery(&self, id: &str, emails: &[String], message_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let newsletter = state
            .newsletters
            .get_mut(id)
            .ok_or_else(|| LecternError::not_found("newsletter", id))?;
        newsletter.delivered.extend(emails.iter().cloned());
        newsletter.message_ids.push(message_id.to_string());
        newsletter.status = NewsletterStatus::Sending;
        Ok(())
    }

    async fn mark_newsletter_sent(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        let newsletter = state
            .newsletters
            .get_mut(id)
            .ok_or_else(|| LecternError::not_found("newsletter", id))?;
        newsletter.status = NewsletterStatus::Sent;
        newsletter.sent_at = Some(at);
        Ok(())
    }

    async fn blacklisted_emails(&self) -> Result<HashSet<String>> {
        Ok(self
            .state
            .read()
            .subscribers
            .values()
            .filter(|s| s.blacklisted)
            .map(|s| s.email.trim().to_lowercase())
            .collect())
    }

    async fn ready_enrollments(&self, now: DateTime<Utc>) -> Result<Vec<ReadyEnrollment>> {
        let state = self.state.read();
        let mut ready = Vec::new();

        for enrollment in state.enrollments.values() {
            let due = enrollment.status == EnrollmentStatus::Active
                && enrollment.next_email_at.map_or(false, |at| at <= now);
            if !due {
                continue;
            }
            let Some(subscriber) = state.subscribers.get(&enrollment.subscriber_id) else {
                continue;
            };
            let mut emails: Vec<SequenceEmail> = state
                .sequence_emails
                .iter()
                .filter(|email| email.sequence_id == enrollment.sequence_id)
                .cloned()
                .collect();
            emails.sort_by_key(|email| email.position);

            ready.push(ReadyEnrollment {
                enrollment: enrollment.clone(),
                sequence_name: state
                    .sequences
                    .get(&enrollment.sequence_id)
                    .cloned()
                    .unwrap_or_default(),
                subscriber_email: subscriber.email.clone(),
                blacklisted: subscriber.blacklisted,
                emails,
            });
        }
        Ok(ready)
    }

    async fn update_enrollment(&self, id: &str, update: &EnrollmentUpdate) -> Result<()> {
        let mut state = self.state.write();
        let enrollment = state
            .enrollments
            .get_mut(id)
            .ok_or_else(|| LecternError::not_found("enrollment", id))?;
        enrollment.status = update.status;
        enrollment.current_email_index = update.current_email_index;
        enrollment.emails_sent = update.emails_sent;
        enrollment.next_email_at = update.next_email_at;
        enrollment.completed_at = update.completed_at;
        Ok(())
    }

    async fn create_backup(&self, backup: &Backup) -> Result<()> {
        self.state.write().backups.push(backup.clone());
        Ok(())
    }

    async fn complete_backup(&self, id: Uuid, size_bytes: i64, at: DateTime<Utc>) -> Result<()> {
        update_backup(&mut self.state.write(), id, |backup| {
            backup.status = BackupStatus::Completed;
            backup.size_bytes = Some(size_bytes);
            backup.completed_at = Some(at);
        })
    }

    async fn fail_backup(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<()> {
        update_backup(&mut self.state.write(), id, |backup| {
            backup.status = BackupStatus::Failed;
            backup.error = Some(error.to_string());
            backup.completed_at = Some(at);
        })
    }
}

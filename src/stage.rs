//! Typed generation stages and the transition table both artifact kinds share.
//!
//! Every mutation of an artifact's `status`/`progress_stage` pair goes through
//! [`transition`], so illegal moves are rejected before anything is written.

use crate::models::{ArtifactKind, ArtifactRow, ArtifactStatus, UserId};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

pub trait Stage: Copy + Eq + Ord + Debug + Serialize + Send + Sync + 'static {
    const KIND: ArtifactKind;
    /// Declared order of the pipeline, `INIT` first and `COMPLETED` last.
    const SEQUENCE: &'static [Self];
    const INIT: Self;
    const AD_COPY_GENERATION: Self;
    const AD_COPY_SELECTION: Self;
    /// First stage of the paid generation work after a copy is selected.
    const GENERATION: Self;
    const COMPLETED: Self;

    fn as_str(&self) -> &'static str;

    fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::SEQUENCE
            .iter()
            .copied()
            .find(|stage| stage.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStage {
    Init,
    AdCopyGeneration,
    AdCopySelection,
    ImageRefinement,
    VideoGeneration,
    TtsGeneration,
    SubtitleGeneration,
    Merging,
    Completed,
}

impl Stage for VideoStage {
    const KIND: ArtifactKind = ArtifactKind::Video;
    const SEQUENCE: &'static [Self] = &[
        VideoStage::Init,
        VideoStage::AdCopyGeneration,
        VideoStage::AdCopySelection,
        VideoStage::ImageRefinement,
        VideoStage::VideoGeneration,
        VideoStage::TtsGeneration,
        VideoStage::SubtitleGeneration,
        VideoStage::Merging,
        VideoStage::Completed,
    ];
    const INIT: Self = VideoStage::Init;
    const AD_COPY_GENERATION: Self = VideoStage::AdCopyGeneration;
    const AD_COPY_SELECTION: Self = VideoStage::AdCopySelection;
    const GENERATION: Self = VideoStage::ImageRefinement;
    const COMPLETED: Self = VideoStage::Completed;

    fn as_str(&self) -> &'static str {
        match self {
            VideoStage::Init => "init",
            VideoStage::AdCopyGeneration => "ad_copy_generation",
            VideoStage::AdCopySelection => "ad_copy_selection",
            VideoStage::ImageRefinement => "image_refinement",
            VideoStage::VideoGeneration => "video_generation",
            VideoStage::TtsGeneration => "tts_generation",
            VideoStage::SubtitleGeneration => "subtitle_generation",
            VideoStage::Merging => "merging",
            VideoStage::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    Init,
    AdCopyGeneration,
    AdCopySelection,
    ImageGeneration,
    Completed,
}

impl Stage for ImageStage {
    const KIND: ArtifactKind = ArtifactKind::Image;
    const SEQUENCE: &'static [Self] = &[
        ImageStage::Init,
        ImageStage::AdCopyGeneration,
        ImageStage::AdCopySelection,
        ImageStage::ImageGeneration,
        ImageStage::Completed,
    ];
    const INIT: Self = ImageStage::Init;
    const AD_COPY_GENERATION: Self = ImageStage::AdCopyGeneration;
    const AD_COPY_SELECTION: Self = ImageStage::AdCopySelection;
    const GENERATION: Self = ImageStage::ImageGeneration;
    const COMPLETED: Self = ImageStage::Completed;

    fn as_str(&self) -> &'static str {
        match self {
            ImageStage::Init => "init",
            ImageStage::AdCopyGeneration => "ad_copy_generation",
            ImageStage::AdCopySelection => "ad_copy_selection",
            ImageStage::ImageGeneration => "image_generation",
            ImageStage::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<S: Stage> {
    GenerateAdCopies,
    AdCopiesReady,
    RegenerateAdCopies,
    SelectAdCopy,
    /// Compensation edge back to `ad_copy_selection` after a failed dispatch.
    RestoreSelection(ArtifactStatus),
    Advance(S),
    Complete,
    Fail,
    Cancel,
}

impl<S: Stage> Action<S> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::GenerateAdCopies => "generate_ad_copies",
            Action::AdCopiesReady => "ad_copies_ready",
            Action::RegenerateAdCopies => "regenerate_ad_copies",
            Action::SelectAdCopy => "select_ad_copy",
            Action::RestoreSelection(_) => "restore_selection",
            Action::Advance(_) => "advance",
            Action::Complete => "complete",
            Action::Fail => "fail",
            Action::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("`{action}` not allowed from {status:?}/{stage}")]
pub struct TransitionError {
    pub action: &'static str,
    pub status: ArtifactStatus,
    pub stage: &'static str,
}

pub fn transition<S: Stage>(
    status: ArtifactStatus,
    stage: S,
    action: Action<S>,
) -> Result<(ArtifactStatus, S), TransitionError> {
    use ArtifactStatus::*;

    let next = match action {
        Action::GenerateAdCopies => match (status, stage) {
            (Pending, s) if s == S::INIT => Some((Processing, S::AD_COPY_GENERATION)),
            (Failed, s) if s == S::INIT || s == S::AD_COPY_GENERATION => {
                Some((Processing, S::AD_COPY_GENERATION))
            }
            _ => None,
        },
        Action::AdCopiesReady => match (status, stage) {
            (Processing, s) if s == S::AD_COPY_GENERATION => Some((Pending, S::AD_COPY_SELECTION)),
            _ => None,
        },
        Action::RegenerateAdCopies => match (status, stage) {
            (Pending | Failed, s) if s == S::AD_COPY_SELECTION => {
                Some((Processing, S::AD_COPY_GENERATION))
            }
            _ => None,
        },
        Action::SelectAdCopy => match (status, stage) {
            (Pending | Failed, s) if s == S::AD_COPY_SELECTION => Some((Processing, S::GENERATION)),
            _ => None,
        },
        Action::RestoreSelection(target) => match (status, stage) {
            (Processing, s)
                if matches!(target, Pending | Failed)
                    && (s == S::AD_COPY_GENERATION || s == S::GENERATION) =>
            {
                Some((target, S::AD_COPY_SELECTION))
            }
            _ => None,
        },
        Action::Advance(target) => match status {
            Processing if stage >= S::GENERATION && target > stage && target != S::COMPLETED => {
                Some((Processing, target))
            }
            _ => None,
        },
        Action::Complete => match status {
            Processing if stage >= S::GENERATION && stage != S::COMPLETED => {
                Some((Completed, S::COMPLETED))
            }
            _ => None,
        },
        Action::Fail => match status {
            Pending | Processing => Some((Failed, stage)),
            _ => None,
        },
        Action::Cancel => match status {
            Pending | Processing => Some((Cancelled, stage)),
            _ => None,
        },
    };

    next.ok_or(TransitionError {
        action: action.name(),
        status,
        stage: stage.as_str(),
    })
}

/// Typed view over an [`ArtifactRow`].
#[derive(Debug, Clone, Serialize)]
pub struct Artifact<S: Stage> {
    pub id: Uuid,
    pub user_id: UserId,
    pub product_image_id: Uuid,
    pub product_info_id: Uuid,
    pub status: ArtifactStatus,
    pub progress_stage: S,
    pub selected_ad_copy: Option<String>,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub is_public: bool,
    pub credits_charged: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<S: Stage> Artifact<S> {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn next(&self, action: Action<S>) -> Result<(ArtifactStatus, S), TransitionError> {
        transition(self.status, self.progress_stage, action)
    }
}

impl<S: Stage> TryFrom<ArtifactRow> for Artifact<S> {
    type Error = StoreError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        let progress_stage = S::parse(&row.progress_stage).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "unknown {:?} stage `{}` on {}",
                S::KIND,
                row.progress_stage,
                row.id
            ))
        })?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            product_image_id: row.product_image_id,
            product_info_id: row.product_info_id,
            status: row.status,
            progress_stage,
            selected_ad_copy: row.selected_ad_copy,
            output_url: row.output_url,
            error_message: row.error_message,
            is_public: row.is_public,
            credits_charged: row.credits_charged,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ArtifactStatus::*;

    #[test]
    fn sequences_are_declared_in_order() {
        assert!(VideoStage::SEQUENCE.windows(2).all(|w| w[0] < w[1]));
        assert!(ImageStage::SEQUENCE.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(VideoStage::SEQUENCE.first(), Some(&VideoStage::INIT));
        assert_eq!(ImageStage::SEQUENCE.last(), Some(&ImageStage::COMPLETED));
    }

    #[test]
    fn parse_round_trips_wire_names() {
        for stage in VideoStage::SEQUENCE {
            assert_eq!(VideoStage::parse(stage.as_str()), Some(*stage));
        }
        assert_eq!(ImageStage::parse("image_generation"), Some(ImageStage::ImageGeneration));
        assert_eq!(ImageStage::parse("merging"), None);
    }

    #[test]
    fn happy_path_is_monotonic() {
        let mut state = (Pending, VideoStage::Init);
        let steps = [
            Action::GenerateAdCopies,
            Action::AdCopiesReady,
            Action::SelectAdCopy,
            Action::Advance(VideoStage::VideoGeneration),
            Action::Advance(VideoStage::Merging),
            Action::Complete,
        ];
        for action in steps {
            let next = transition(state.0, state.1, action).expect("legal step");
            assert!(next.1 >= state.1, "{action:?} regressed the stage");
            state = next;
        }
        assert_eq!(state, (Completed, VideoStage::Completed));
    }

    #[test]
    fn select_requires_selection_stage() {
        let err = transition(Processing, ImageStage::AdCopyGeneration, Action::SelectAdCopy)
            .expect_err("not at selection");
        assert_eq!(err.action, "select_ad_copy");
        assert_eq!(err.stage, "ad_copy_generation");
        assert_eq!(
            transition(Failed, ImageStage::AdCopySelection, Action::SelectAdCopy),
            Ok((Processing, ImageStage::ImageGeneration))
        );
    }

    #[test]
    fn regenerate_requires_exactly_selection() {
        assert!(transition(Pending, VideoStage::Init, Action::RegenerateAdCopies).is_err());
        assert!(
            transition(Processing, VideoStage::ImageRefinement, Action::RegenerateAdCopies)
                .is_err()
        );
        assert_eq!(
            transition(Pending, VideoStage::AdCopySelection, Action::RegenerateAdCopies),
            Ok((Processing, VideoStage::AdCopyGeneration))
        );
    }

    #[test]
    fn restore_selection_is_the_only_backward_edge() {
        assert_eq!(
            transition(
                Processing,
                VideoStage::ImageRefinement,
                Action::RestoreSelection(Failed)
            ),
            Ok((Failed, VideoStage::AdCopySelection))
        );
        assert!(
            transition(
                Processing,
                VideoStage::Merging,
                Action::RestoreSelection(Failed)
            )
            .is_err()
        );
        assert!(
            transition(
                Processing,
                VideoStage::ImageRefinement,
                Action::RestoreSelection(Completed)
            )
            .is_err()
        );
        assert!(
            transition(
                Processing,
                VideoStage::Merging,
                Action::Advance(VideoStage::VideoGeneration)
            )
            .is_err()
        );
    }

    #[test]
    fn advance_cannot_skip_to_completed_or_jump_from_copy_stages() {
        assert!(
            transition(
                Processing,
                VideoStage::TtsGeneration,
                Action::Advance(VideoStage::Completed)
            )
            .is_err()
        );
        assert!(
            transition(
                Processing,
                VideoStage::AdCopyGeneration,
                Action::Advance(VideoStage::Merging)
            )
            .is_err()
        );
        assert!(transition(Processing, ImageStage::AdCopyGeneration, Action::Complete).is_err());
    }

    #[test]
    fn cancel_only_from_live_states() {
        for status in [Pending, Processing] {
            assert_eq!(
                transition(status, ImageStage::ImageGeneration, Action::Cancel),
                Ok((Cancelled, ImageStage::ImageGeneration))
            );
        }
        for status in [Completed, Failed, Cancelled] {
            let err = transition(status, ImageStage::ImageGeneration, Action::Cancel)
                .expect_err("terminal");
            assert_eq!(err.status, status);
        }
    }

    #[test]
    fn failed_first_generation_can_retry() {
        assert_eq!(
            transition(Failed, ImageStage::AdCopyGeneration, Action::GenerateAdCopies),
            Ok((Processing, ImageStage::AdCopyGeneration))
        );
        assert!(transition(Failed, ImageStage::AdCopySelection, Action::GenerateAdCopies).is_err());
    }

    #[test]
    fn artifact_rejects_unknown_stage() {
        let row = ArtifactRow {
            id: Uuid::new_v4(),
            user_id: "user_1".into(),
            product_image_id: Uuid::new_v4(),
            product_info_id: Uuid::new_v4(),
            status: Pending,
            progress_stage: "merging".into(),
            selected_ad_copy: None,
            output_url: None,
            error_message: None,
            is_public: false,
            credits_charged: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        assert!(Artifact::<VideoStage>::try_from(row.clone()).is_ok());
        assert!(matches!(
            Artifact::<ImageStage>::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}

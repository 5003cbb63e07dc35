//! End-to-end tests of the anonymisation stage with in-memory fakes for the
//! node, the pseudonym seam, and the export queue.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anonymiser::{process_study, AppState, ExportNotifier, ProcessError, StudyNode};
use deid::{PseudonymSource, StudyInfo};
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use patient_queue::ExportMessage;

const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
const SLUG: &str = "test-extract-uclh-omop-cdm";

struct FakeNode {
    instances: Vec<Vec<u8>>,
}

#[async_trait::async_trait]
impl StudyNode for FakeNode {
    async fn instance_ids(&self, _study_id: &str) -> anyhow::Result<Vec<String>> {
        Ok((0..self.instances.len()).map(|i| i.to_string()).collect())
    }

    async fn instance_file(&self, instance_id: &str) -> anyhow::Result<Vec<u8>> {
        Ok(self.instances[instance_id.parse::<usize>()?].clone())
    }
}

struct FakePseudonyms {
    study_uids: Mutex<HashMap<String, String>>,
}

#[async_trait::async_trait]
impl PseudonymSource for FakePseudonyms {
    async fn secure_hash(
        &self,
        project_slug: &str,
        message: &str,
        _length: u32,
    ) -> anyhow::Result<String> {
        Ok(format!("hash-{project_slug}-{message}"))
    }

    async fn pseudo_study_uid(
        &self,
        _project_slug: &str,
        study: &StudyInfo,
    ) -> anyhow::Result<String> {
        let mut assigned = self.study_uids.lock().unwrap();
        let next = format!("2.25.{}", assigned.len() + 1);
        Ok(assigned.entry(study.accession_number.clone()).or_insert(next).clone())
    }

    async fn pseudo_patient_id(
        &self,
        _project_slug: &str,
        _mrn: &str,
        hashed_candidate: &str,
    ) -> anyhow::Result<String> {
        Ok(hashed_candidate.to_string())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<ExportMessage>>,
}

#[async_trait::async_trait]
impl ExportNotifier for RecordingNotifier {
    async fn notify(&self, message: &ExportMessage) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn write_config_tree(dir: &Path) {
    std::fs::create_dir_all(dir.join("tag-operations")).unwrap();
    std::fs::write(
        dir.join(format!("{SLUG}.yaml")),
        r#"
project:
  name: "Test Extract - UCLH OMOP CDM"
  modalities: ["DX", "CR"]
series_filters: ["localizer"]
allowed_manufacturers:
  - regex: "philips"
tag_operation_files:
  base:
    - "base.yaml"
destination:
  dicom: "ftps"
  parquet: "ftps"
"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("tag-operations/base.yaml"),
        r#"
- {group: 0x0008, element: 0x0016, op: "keep"}
- {group: 0x0008, element: 0x0018, op: "keep"}
- {group: 0x0008, element: 0x0060, op: "keep"}
- {group: 0x0010, element: 0x0020, op: "keep"}
- {group: 0x0020, element: 0x000D, op: "keep"}
"#,
    )
    .unwrap();
}

fn instance_file(sop_instance_uid: &str, modality: &str, series_description: &str) -> Vec<u8> {
    let text = |value: &str| PrimitiveValue::from(value);
    let dataset = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, text("1.2.840.10008.5.1.4.1.1.1")),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, text(sop_instance_uid)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, text("1.2.3.4.5")),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, text("1.2.3.4.5.1")),
        DataElement::new(tags::MODALITY, VR::CS, text(modality)),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, text(series_description)),
        DataElement::new(tags::MANUFACTURER, VR::LO, text("Philips Healthcare")),
        DataElement::new(tags::PATIENT_ID, VR::LO, text("987654321")),
        DataElement::new(tags::ACCESSION_NUMBER, VR::SH, text("AA12345601")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, text("DOE^JANE")),
        // The stamped project marker, in private block 0x10.
        DataElement::new(Tag(0x000D, 0x0010), VR::LO, text("UCLH PIXL")),
        DataElement::new(Tag(0x000D, 0x1001), VR::LO, text(SLUG)),
    ]);

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.1")
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .unwrap();

    let mut bytes = Vec::new();
    dataset.with_exact_meta(meta).write_all(&mut bytes).unwrap();
    bytes
}

fn state(instances: Vec<Vec<u8>>, dirs: &Path) -> (AppState, Arc<RecordingNotifier>) {
    write_config_tree(&dirs.join("configs"));
    let notifier = Arc::new(RecordingNotifier::default());
    let state = AppState {
        node: Arc::new(FakeNode { instances }),
        pseudonyms: Arc::new(FakePseudonyms {
            study_uids: Mutex::new(HashMap::new()),
        }),
        exports: notifier.clone(),
        configs_dir: dirs.join("configs"),
        spool_dir: dirs.join("spool"),
        fallback_project: None,
    };
    (state, notifier)
}

#[tokio::test]
async fn test_stable_study_is_scrubbed_zipped_and_announced() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, notifier) = state(
        vec![
            instance_file("1.2.3.4.5.1.1", "DX", "axial"),
            instance_file("1.2.3.4.5.1.2", "DX", "axial"),
        ],
        tmp.path(),
    );

    let processed = process_study(&state, "study-1").await.unwrap();
    assert_eq!(processed.instances, 2);
    assert_eq!(processed.skipped, 0);
    assert_eq!(processed.pseudo_study_uid, "2.25.1");

    // One export message, addressed by the pseudonymous UID.
    let announced = notifier.messages.lock().unwrap().clone();
    assert_eq!(
        announced,
        vec![ExportMessage {
            project_name: SLUG.to_string(),
            pseudo_study_uid: "2.25.1".to_string(),
        }],
    );

    // The spooled zip holds both instances, scrubbed.
    let zip_path = tmp.path().join("spool/2.25.1.zip");
    let mut archive = zip::ZipArchive::new(std::fs::File::open(zip_path).unwrap()).unwrap();
    assert_eq!(archive.len(), 2);

    let mut entry_bytes = Vec::new();
    archive
        .by_name("1.2.3.4.5.1.1.dcm")
        .unwrap()
        .read_to_end(&mut entry_bytes)
        .unwrap();
    let scrubbed = dicom_object::from_reader(entry_bytes.as_slice()).unwrap();

    // Identifiers are pseudonymous, names and markers are gone.
    assert_eq!(
        scrubbed.element(tags::STUDY_INSTANCE_UID).unwrap().to_str().unwrap().trim_end(),
        "2.25.1",
    );
    assert_eq!(
        scrubbed.element(tags::PATIENT_ID).unwrap().to_str().unwrap().trim_end(),
        format!("hash-{SLUG}-987654321"),
    );
    assert!(scrubbed.element(tags::PATIENT_NAME).is_err());
    assert!(scrubbed.element(Tag(0x000D, 0x0010)).is_err());
    assert!(scrubbed.element(Tag(0x000D, 0x1001)).is_err());
}

#[tokio::test]
async fn test_wrong_modality_instances_are_skipped_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, notifier) = state(
        vec![
            instance_file("1.2.3.4.5.1.1", "DX", "axial"),
            instance_file("1.2.3.4.5.1.2", "MR", "axial"),
        ],
        tmp.path(),
    );

    let processed = process_study(&state, "study-1").await.unwrap();
    assert_eq!(processed.instances, 1);
    assert_eq!(processed.skipped, 1);
    assert_eq!(notifier.messages.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_undecodable_instance_is_dropped_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, _notifier) = state(
        vec![
            instance_file("1.2.3.4.5.1.1", "DX", "axial"),
            b"not a dicom file at all".to_vec(),
        ],
        tmp.path(),
    );

    let processed = process_study(&state, "study-1").await.unwrap();
    assert_eq!(processed.instances, 1);
    assert_eq!(processed.discarded, 1);
}

#[tokio::test]
async fn test_all_instances_skipped_is_a_discard() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, notifier) = state(
        vec![instance_file("1.2.3.4.5.1.1", "MR", "axial")],
        tmp.path(),
    );

    let err = process_study(&state, "study-1").await.unwrap_err();
    assert!(matches!(err, ProcessError::EmptyStudy), "{err}");
    assert!(notifier.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_filtered_series_discards_the_study() {
    let tmp = tempfile::tempdir().unwrap();
    let (state, notifier) = state(
        vec![
            instance_file("1.2.3.4.5.1.1", "DX", "LOCALIZER head"),
            instance_file("1.2.3.4.5.1.2", "DX", "axial"),
        ],
        tmp.path(),
    );

    let err = process_study(&state, "study-1").await.unwrap_err();
    assert!(matches!(err, ProcessError::Discarded(_)), "{err}");
    assert!(notifier.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unstamped_study_without_fallback_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();

    // Build an instance without the private marker elements.
    let dataset = InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.1"),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("DX")),
    ]);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.1")
        .media_storage_sop_instance_uid("1.2.3")
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .unwrap();
    let mut bytes = Vec::new();
    dataset.with_exact_meta(meta).write_all(&mut bytes).unwrap();

    let (state, _notifier) = state(vec![bytes], tmp.path());
    let err = process_study(&state, "study-1").await.unwrap_err();
    assert!(matches!(err, ProcessError::MissingProjectTag), "{err}");
}

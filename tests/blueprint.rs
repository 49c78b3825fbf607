//! End-to-end synthesis of the platform blueprint.

#![allow(clippy::unwrap_used)]

use secrecy::SecretString;
use tacklebox::{
    blueprint::{build, TopologyConfig},
    topology::{store::CredentialPolicy, validate::Warning},
};

#[test]
fn default_topology_synthesizes() {
    let mut assembly = build(&TopologyConfig::default()).unwrap();
    let synthesis = assembly.synthesize().unwrap();
    let manifest = &synthesis.manifest;

    let iam = manifest.unit("tacklebox-iam").unwrap();
    assert!(iam.depends_on.is_empty());
    for export in ["lambdaVpcRole", "lambdaVpcSnsRole", "lambdaVpcSnsLogsRole"] {
        assert_eq!(iam.template["Outputs"][export]["Export"]["Name"], export);
    }

    let app = manifest.unit("Tacklebox").unwrap();
    assert_eq!(app.depends_on, vec!["tacklebox-iam".to_string()]);
    for export in ["apiHost", "apiKeyId", "dbSetupLambda"] {
        assert_eq!(app.template["Outputs"][export]["Export"]["Name"], export);
    }

    let resources = manifest.resources("Tacklebox").unwrap();
    assert_eq!(resources["tackleboxdb"]["Type"], "AWS::RDS::DBInstance");
    assert_eq!(
        resources["tackleboxdbSecurityGroup"]["Properties"]["SecurityGroupIngress"][0]["FromPort"],
        5432
    );
    assert_eq!(
        resources["ManageMessages"]["Properties"]["Environment"]["Variables"]["RESEND_ARN"],
        serde_json::json!({ "Ref": "Topic" })
    );

    assert!(synthesis
        .report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::InsecureCredentials { .. })));
}

#[test]
fn generated_credentials_stay_out_of_the_template() {
    let config = TopologyConfig {
        credentials: CredentialPolicy::Generated {
            username: "tackleboxadmin".to_string(),
        },
        ..TopologyConfig::default()
    };
    let mut assembly = build(&config).unwrap();
    let synthesis = assembly.synthesize().unwrap();
    assert!(!synthesis
        .report
        .warnings
        .iter()
        .any(|w| matches!(w, Warning::InsecureCredentials { .. })));

    let rendered = serde_json::to_string(&synthesis.manifest).unwrap();
    assert!(!rendered.contains("testing123!"));
    let resources = synthesis.manifest.resources("Tacklebox").unwrap();
    assert_eq!(
        resources["tackleboxdbSecret"]["Type"],
        "AWS::SecretsManager::Secret"
    );
}

#[test]
fn prefix_names_roles_and_topic() {
    let config = TopologyConfig {
        prefix: "Staging".to_string(),
        credentials: CredentialPolicy::Fixed {
            username: "admin".to_string(),
            password: SecretString::from("hunter22".to_string()),
        },
        ..TopologyConfig::default()
    };
    let assembly = build(&config).unwrap();
    let iam = assembly.find_unit("tacklebox-iam").unwrap();
    assert_eq!(
        iam.roles()
            .iter()
            .filter(|role| role.name().starts_with("Staging_"))
            .count(),
        3
    );
    let app = assembly.find_unit("Tacklebox").unwrap();
    assert!(app.topics()[0].topic_name().starts_with("Staging"));
}

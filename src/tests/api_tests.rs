#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};

    use crate::tests::support::{id_of, TestApp, ADMIN_TOKEN, COLLEGE};

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_rejected() {
        let app = TestApp::new().await;

        let (status, body) = app.request(Method::GET, "/students", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = app.get("/students", "not-a-real-token").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_platform_admin_needs_college_context() {
        let app = TestApp::new().await;
        let (status, body) = app.get("/students", ADMIN_TOKEN).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "College context required");
    }

    #[tokio::test]
    async fn test_users_me_and_token_rotation() {
        let app = TestApp::new().await;
        let (id, token) = app.create_user(&app.admin, "Ravi", "ravi@north.edu", "counselor", None).await;

        let (status, body) = app.get("/users/me", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["principal"]["role"], "counselor");
        assert_eq!(body["principal"]["college_id"], COLLEGE);
        assert!(body["user"].get("token_hash").is_none());

        let (status, body) = app.post(&format!("/users/{}/rotate-token", id), &token, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let fresh = body["token"].as_str().unwrap().to_string();

        let (status, _) = app.get("/users/me", &token).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.get("/users/me", &fresh).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_college_admin_cannot_create_admins() {
        let app = TestApp::new().await;
        let (status, body) = app
            .post("/users", &app.admin, json!({ "name": "X", "email": "x@north.edu", "role": "college_admin" }))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["message"], "Not enough permissions");

        let (status, body) = app
            .post("/users", &app.admin, json!({ "name": "Dup", "email": "office@north.edu", "role": "auditor" }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], "email");
    }

    #[tokio::test]
    async fn test_student_create_and_duplicate_contact() {
        let app = TestApp::new().await;
        let student = app.lead(1, "mh", "B.Tech").await;
        assert_eq!(student["state_code"], "MH");
        assert_eq!(student["lead_stage"], "fresh");
        assert_eq!(student["college_id"], COLLEGE);
        assert_eq!(student["timeline"].as_array().unwrap().len(), 1);

        let (status, body) = app
            .post(
                "/students",
                &app.admin,
                json!({ "name": "Copy", "email": "STUDENT1@mail.test", "mobile": "9123456789" }),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], "email");

        let (status, body) = app
            .post("/students", &app.admin, json!({ "name": "Bad", "email": "nope", "mobile": "9123456789" }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["message"], "Invalid email address");
    }

    #[tokio::test]
    async fn test_student_list_pagination_and_filters() {
        let app = TestApp::new().await;
        for n in 1..=3 {
            app.lead(n, "MH", "B.Tech").await;
        }
        app.lead(4, "KA", "MBA").await;

        let (status, body) = app.get("/students?page_num=1&page_size=2", &app.admin).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 4);
        assert_eq!(body["count"], 2);
        assert_eq!(body["message"], "Get data.");
        assert!(body["pagination"]["next"].as_str().unwrap().contains("page_num=2"));
        assert_eq!(body["pagination"]["previous"], Value::Null);

        let (_, body) = app.get("/students?state_code=KA", &app.admin).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["data"][0]["course_name"], "MBA");

        let (_, body) = app.get("/students?sort=name&sort_type=asc", &app.admin).await;
        assert_eq!(body["data"][0]["name"], "Student 1");

        let (status, body) = app.get("/students?sort=password", &app.admin).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], "sort");

        let (status, _) = app.get("/students?page_num=0", &app.admin).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_counselor_sees_only_own_leads() {
        let app = TestApp::new().await;
        let (counselor_id, counselor) = app.create_user(&app.admin, "Meera", "meera@north.edu", "counselor", None).await;

        let own = app.create_student(&counselor, json!({ "name": "Own", "email": "own@mail.test", "mobile": "9000000001" })).await;
        assert_eq!(own["counselor_id"], counselor_id.as_str());
        let other = app.lead(2, "MH", "B.Tech").await;

        let (_, body) = app.get("/students", &counselor).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["data"][0]["name"], "Own");

        let (status, _) = app.get(&format!("/students/{}", id_of(&other)), &counselor).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // counselors cannot reassign leads
        let (status, _) = app
            .post(&format!("/students/{}/counselor", id_of(&own)), &counselor, json!({ "counselor_id": counselor_id }))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = app
            .post(&format!("/students/{}/counselor", id_of(&other)), &app.admin, json!({ "counselor_id": counselor_id }))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        let (_, body) = app.get("/students", &counselor).await;
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn test_assign_rejects_non_counselor() {
        let app = TestApp::new().await;
        let (auditor_id, _) = app.create_user(&app.admin, "Aud", "aud@north.edu", "auditor", None).await;
        let student = app.lead(1, "MH", "B.Tech").await;
        let (status, body) = app
            .post(&format!("/students/{}/counselor", id_of(&student)), &app.admin, json!({ "counselor_id": auditor_id }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], "counselor_id");
    }

    #[tokio::test]
    async fn test_update_student_and_lead_stage() {
        let app = TestApp::new().await;
        let student = app.lead(1, "MH", "B.Tech").await;
        let other = app.lead(2, "MH", "B.Tech").await;
        let id = id_of(&student);

        let (status, body) = app.put(&format!("/students/{}", id), &app.admin, json!({ "city": "Nagpur", "twelve_score": 88.5 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["city"], "Nagpur");
        assert_eq!(body["data"]["twelve_score"], 88.5);

        let (status, _) = app.put(&format!("/students/{}", id), &app.admin, json!({ "email": other["email"] })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = app.put(&format!("/students/{}", id), &app.admin, json!({ "college_id": "elsewhere" })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["field"], "college_id");

        let (status, body) = app
            .post(&format!("/students/{}/lead-stage", id), &app.admin, json!({ "lead_stage": "interested", "note": "called back" }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["lead_stage"], "interested");
        let timeline = body["data"]["timeline"].as_array().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[1]["note"], "called back");
    }

    #[tokio::test]
    async fn test_delete_student_removes_applications() {
        let app = TestApp::new().await;
        let student = app.lead(1, "MH", "B.Tech").await;
        let application = app.application(&id_of(&student), "B.Tech", 1000.0).await;

        let (status, body) = app.request(Method::DELETE, &format!("/students/{}", id_of(&student)), Some(&app.admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Student deleted.");

        let (status, _) = app.get(&format!("/applications/{}", id_of(&application)), &app.admin).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_student_releases_slot_and_scholarship() {
        let app = TestApp::new().await;
        let (panelist_id, _) = app.create_user(&app.admin, "Dr. Rao", "rao@north.edu", "panelist", None).await;
        let (_, body) = app
            .post(
                "/interview-slots",
                &app.admin,
                json!({
                    "course_name": "B.Tech",
                    "start_time": "2030-05-01T10:00:00Z",
                    "end_time": "2030-05-01T11:00:00Z",
                    "capacity": 2,
                    "panelist_ids": [panelist_id],
                }),
            )
            .await;
        let slot_id = id_of(&body["data"]);
        let (_, body) = app.post("/scholarships", &app.admin, json!({ "name": "Merit", "percentage": 25.0, "seats": 2 })).await;
        let scholarship_id = id_of(&body["data"]);

        let leaving = app.lead(1, "MH", "B.Tech").await;
        let staying = app.lead(2, "MH", "B.Tech").await;
        let leaving_app = app.submitted_application(&id_of(&leaving), "B.Tech").await;
        let staying_app = app.submitted_application(&id_of(&staying), "B.Tech").await;
        for application in [&leaving_app, &staying_app] {
            let (status, body) = app
                .post(&format!("/interview-slots/{}/book", slot_id), &app.admin, json!({ "application_id": application }))
                .await;
            assert_eq!(status, StatusCode::OK, "{}", body);
        }
        for student in [&leaving, &staying] {
            let (status, body) = app
                .post(&format!("/scholarships/{}/allocate", scholarship_id), &app.admin, json!({ "student_id": id_of(student) }))
                .await;
            assert_eq!(status, StatusCode::OK, "{}", body);
        }

        let (status, _) = app.request(Method::DELETE, &format!("/students/{}", id_of(&leaving)), Some(&app.admin), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = app.get(&format!("/interview-slots/{}", slot_id), &app.admin).await;
        assert_eq!(body["data"]["booked"], json!([staying_app]));
        assert_eq!(body["data"]["seats_left"], 1);
        let (_, body) = app.get(&format!("/scholarships/{}", scholarship_id), &app.admin).await;
        assert_eq!(body["data"]["allocated"], json!([id_of(&staying)]));

        // the freed seat can be granted again
        let third = app.lead(3, "MH", "B.Tech").await;
        let (status, _) = app
            .post(&format!("/scholarships/{}/allocate", scholarship_id), &app.admin, json!({ "student_id": id_of(&third) }))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_object_id() {
        let app = TestApp::new().await;
        let (status, body) = app.get("/students/not-an-id", &app.admin).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "INVALID_OBJECT_ID");
    }

    #[tokio::test]
    async fn test_application_payment_and_submission() {
        let app = TestApp::new().await;
        let student = app.lead(1, "MH", "B.Tech").await;
        let student_id = id_of(&student);
        let application = app.application(&student_id, "B.Tech", 1000.0).await;
        let id = id_of(&application);
        assert_eq!(application["payment_status"], "unpaid");
        assert_eq!(application["stage"], "initiated");
        assert_eq!(application["student"]["name"], "Student 1");

        let (status, _) = app
            .post("/applications", &app.admin, json!({ "student_id": student_id, "course_name": "B.Tech", "fee": 10.0 }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = app.post(&format!("/applications/{}/submit", id), &app.admin, json!({})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["message"], "Application fee has not been paid");

        let payment = |amount: f64| json!({ "amount": amount, "reference": "UPI-42" });
        let (status, _) = app.post(&format!("/applications/{}/payment", id), &app.admin, payment(400.0)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, body) = app.post(&format!("/applications/{}/payment", id), &app.admin, payment(1000.0)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["payment_status"], "paid");
        assert_eq!(body["data"]["payment"]["reference"], "UPI-42");
        let (status, _) = app.post(&format!("/applications/{}/payment", id), &app.admin, payment(1000.0)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = app.put(&format!("/applications/{}", id), &app.admin, json!({ "fee": 2000.0 })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = app.post(&format!("/applications/{}/submit", id), &app.admin, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["stage"], "submitted");

        let (_, body) = app.get(&format!("/students/{}", student_id), &app.admin).await;
        assert_eq!(body["data"]["payment_status"], "paid");
        assert_eq!(body["data"]["application_stage"], "submitted");

        let (_, body) = app.get("/applications?payment_status=paid", &app.admin).await;
        assert_eq!(body["total"], 1);
        let (_, body) = app.get("/applications?stage=initiated", &app.admin).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_application_snapshot_follows_student_updates() {
        let app = TestApp::new().await;
        let student = app.lead(1, "MH", "B.Tech").await;
        let application = app.application(&id_of(&student), "B.Tech", 1000.0).await;

        app.put(&format!("/students/{}", id_of(&student)), &app.admin, json!({ "name": "Renamed" })).await;
        let (_, body) = app.get(&format!("/applications/{}", id_of(&application)), &app.admin).await;
        assert_eq!(body["data"]["student"]["name"], "Renamed");
    }

    async fn voucher(app: &TestApp, code: &str, max_uses: u64, start: &str, end: &str) -> (StatusCode, Value) {
        app.post(
            "/promocodes",
            &app.admin,
            json!({ "code": code, "discount_percentage": 10.0, "max_uses": max_uses, "start_date": start, "end_date": end }),
        )
        .await
    }

    #[tokio::test]
    async fn test_promocode_apply_and_usage_limit() {
        let app = TestApp::new().await;
        let (status, body) = voucher(&app, "early-10", 1, "2000-01-01", "2999-12-31").await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["data"]["code"], "EARLY-10");
        let voucher_id = id_of(&body["data"]);

        let (status, _) = voucher(&app, "EARLY-10", 5, "2000-01-01", "2999-12-31").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let first = app.application(&id_of(&app.lead(1, "MH", "B.Tech").await), "B.Tech", 1000.0).await;
        let second = app.application(&id_of(&app.lead(2, "MH", "B.Tech").await), "B.Tech", 1000.0).await;

        let (status, body) = app
            .post("/promocodes/apply", &app.admin, json!({ "code": "early-10", "application_id": id_of(&first) }))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["payable_fee"], 900.0);
        assert_eq!(body["data"]["promocode"]["code"], "EARLY-10");

        let (status, _) = app
            .post("/promocodes/apply", &app.admin, json!({ "code": "EARLY-10", "application_id": id_of(&first) }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = app
            .post("/promocodes/apply", &app.admin, json!({ "code": "EARLY-10", "application_id": id_of(&second) }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["message"], "Promocode usage limit reached");

        // the losing application is released again
        let (_, body) = app.get(&format!("/applications/{}", id_of(&second)), &app.admin).await;
        assert_eq!(body["data"]["promocode"], Value::Null);
        assert_eq!(body["data"]["payable_fee"], 1000.0);

        let (_, body) = app.get(&format!("/promocodes/{}", voucher_id), &app.admin).await;
        assert_eq!(body["data"]["used_count"], 1);

        let (status, _) = app.put(&format!("/promocodes/{}", voucher_id), &app.admin, json!({ "max_uses": 0 })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        // paying the discounted fee is enough
        let (status, _) = app
            .post(&format!("/applications/{}/payment", id_of(&first)), &app.admin, json!({ "amount": 900.0, "reference": "R" }))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_promocode_outside_window() {
        let app = TestApp::new().await;
        let (status, _) = voucher(&app, "OLD", 10, "2001-01-01", "2001-12-31").await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = voucher(&app, "BACKWARDS", 10, "2030-01-01", "2029-01-01").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let application = app.application(&id_of(&app.lead(1, "MH", "B.Tech").await), "B.Tech", 1000.0).await;
        let (status, body) = app
            .post("/promocodes/apply", &app.admin, json!({ "code": "old", "application_id": id_of(&application) }))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["details"]["message"], "Promocode is not valid at this time");

        let (status, _) = app
            .post("/promocodes/apply", &app.admin, json!({ "code": "MISSING", "application_id": id_of(&application) }))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_college_is_invisible() {
        let app = TestApp::new().await;
        let (_, other_admin) = app.create_user(ADMIN_TOKEN, "South", "office@south.edu", "college_admin", Some("college-south")).await;
        let student = app.lead(1, "MH", "B.Tech").await;

        let (status, _) = app.get(&format!("/students/{}", id_of(&student)), &other_admin).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, body) = app.get("/students", &other_admin).await;
        assert_eq!(body["total"], 0);

        // same contact details are fine in another college
        let (status, _) = app
            .post(
                "/students",
                &other_admin,
                json!({ "name": "Twin", "email": "student1@mail.test", "mobile": student["mobile"] }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
}
